//! Application configuration, sourced from the environment.
//!
//! One source of truth: every tunable lives here, threaded to tasks through
//! the `Context` built in `main`. No component reads `env::var` directly.

use std::collections::HashMap;
use std::env;

use crate::error::{FeedError, FeedResult};
use crate::models::Exchange;

/// Scorer weighting; the emitted fields are the contract, weights are tuning.
#[derive(Debug, Clone)]
pub struct ScorerWeights {
    pub delta: f64,
    pub tape: f64,
    pub absorption: f64,
    pub exhaustion_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    pub gateway_bind: String,
    /// Canonical symbols per venue.
    pub symbols: HashMap<Exchange, Vec<String>>,
    /// Top-N depth published on the DOM stream.
    pub book_depth: usize,
    pub dom_stream_maxlen: usize,
    pub trades_stream_maxlen: usize,
    pub heatmap_bin_mult: f64,
    pub heatmap_interval_ms: u64,
    pub heatmap_stream_maxlen: usize,
    pub footprint_bar_ms: i64,
    pub imbalance_ratio: f64,
    pub tape_window_ms: i64,
    pub tape_interval_ms: u64,
    pub iceberg_k: f64,
    pub iceberg_r: u32,
    pub iceberg_window_ms: i64,
    pub wall_x: f64,
    pub wall_t1_ms: i64,
    pub spoof_t2_ms: i64,
    /// Consecutive resnapshots per minute before a venue is flagged unstable.
    pub resnapshot_alarm_per_min: u32,
    pub snapshot_retries: u32,
    pub scorer: ScorerWeights,
    /// Per-symbol tick size overrides (`TICK_SIZES=BTCUSDT=0.1,ETHUSDT=0.01`).
    tick_sizes: HashMap<String, f64>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_symbols(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> FeedResult<Self> {
        let broker_url = env::var("BROKER_URL")
            .map_err(|_| FeedError::Config("BROKER_URL is required".to_string()))?;
        if !broker_url.starts_with("redis://") && !broker_url.starts_with("rediss://") {
            return Err(FeedError::Config(format!(
                "BROKER_URL must be a redis:// URL, got {broker_url}"
            )));
        }

        let mut symbols = HashMap::new();
        symbols.insert(Exchange::Bybit, env_symbols("SYMBOLS_BYBIT"));
        symbols.insert(Exchange::Binance, env_symbols("SYMBOLS_BINANCE"));
        symbols.insert(Exchange::Okx, env_symbols("SYMBOLS_OKX"));

        let mut tick_sizes = HashMap::new();
        if let Ok(raw) = env::var("TICK_SIZES") {
            for pair in raw.split(',') {
                let mut it = pair.splitn(2, '=');
                let (Some(sym), Some(step)) = (it.next(), it.next()) else {
                    continue;
                };
                match step.trim().parse::<f64>() {
                    Ok(step) if step > 0.0 => {
                        tick_sizes.insert(sym.trim().to_uppercase(), step);
                    }
                    _ => {
                        return Err(FeedError::Config(format!(
                            "TICK_SIZES entry is not a positive number: {pair}"
                        )))
                    }
                }
            }
        }

        Ok(Self {
            broker_url,
            gateway_bind: env::var("GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:8090".to_string()),
            symbols,
            tick_sizes,
            book_depth: env_parse("BOOK_DEPTH", 200),
            dom_stream_maxlen: env_parse("DOM_MAXLEN", 1_000),
            trades_stream_maxlen: env_parse("TRADES_MAXLEN", 10_000),
            heatmap_bin_mult: env_parse("HEATMAP_BIN_MULT", 10.0),
            heatmap_interval_ms: env_parse("HEATMAP_INTERVAL_MS", 1_000),
            heatmap_stream_maxlen: env_parse("HEATMAP_MAXLEN", 600),
            footprint_bar_ms: env_parse("FOOTPRINT_BAR_MS", 60_000),
            imbalance_ratio: env_parse("IMBALANCE_RATIO", 3.0),
            tape_window_ms: env_parse("TAPE_WINDOW_MS", 60_000),
            tape_interval_ms: env_parse("TAPE_INTERVAL_MS", 1_000),
            iceberg_k: env_parse("ICEBERG_K", 5.0),
            iceberg_r: env_parse("ICEBERG_R", 3),
            iceberg_window_ms: env_parse("ICEBERG_WINDOW_MS", 60_000),
            wall_x: env_parse("WALL_X", 10.0),
            wall_t1_ms: env_parse("WALL_T1_MS", 5_000),
            spoof_t2_ms: env_parse("SPOOF_T2_MS", 1_000),
            resnapshot_alarm_per_min: env_parse("RESNAPSHOT_ALARM_PER_MIN", 5),
            snapshot_retries: env_parse("SNAPSHOT_RETRIES", 5),
            scorer: ScorerWeights {
                delta: env_parse("TREND_W_DELTA", 0.5),
                tape: env_parse("TREND_W_TAPE", 0.3),
                absorption: env_parse("TREND_W_ABSORB", 0.2),
                exhaustion_threshold: env_parse("EXHAUSTION_THRESHOLD", 0.7),
            },
        })
    }

    /// Venue tick size for a canonical symbol. The heatmap bin size is
    /// derived from this in exactly one place (`bin_size`).
    pub fn tick_size(&self, symbol: &str) -> f64 {
        if let Some(step) = self.tick_sizes.get(symbol) {
            return *step;
        }
        match symbol {
            "BTCUSDT" => 0.1,
            "ETHUSDT" => 0.01,
            "SOLUSDT" => 0.001,
            "XRPUSDT" => 0.0001,
            _ => 0.01,
        }
    }

    pub fn bin_size(&self, symbol: &str) -> f64 {
        self.tick_size(symbol) * self.heatmap_bin_mult
    }

    /// All configured (exchange, symbol) pairs.
    pub fn instruments(&self) -> Vec<crate::models::Instrument> {
        let mut out = Vec::new();
        for ex in Exchange::ALL {
            if let Some(syms) = self.symbols.get(&ex) {
                for s in syms {
                    out.push(crate::models::Instrument::new(ex, s.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process env is shared across test threads; serialize every test that
    // touches it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_broker_url_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("BROKER_URL");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn non_redis_broker_url_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("BROKER_URL", "http://127.0.0.1:6379");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
        env::remove_var("BROKER_URL");
    }

    #[test]
    fn symbol_lists_are_parsed_and_upcased() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("BROKER_URL", "redis://127.0.0.1:6379");
        env::set_var("SYMBOLS_BYBIT", "btcusdt, ethusdt ,");
        let cfg = Config::from_env().unwrap();
        assert_eq!(
            cfg.symbols[&Exchange::Bybit],
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
        env::remove_var("SYMBOLS_BYBIT");
        env::remove_var("BROKER_URL");
    }

    #[test]
    fn bin_size_is_tick_size_times_multiplier() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("BROKER_URL", "redis://127.0.0.1:6379");
        let cfg = Config::from_env().unwrap();
        let expected = cfg.tick_size("BTCUSDT") * cfg.heatmap_bin_mult;
        assert!((cfg.bin_size("BTCUSDT") - expected).abs() < f64::EPSILON);
        env::remove_var("BROKER_URL");
    }

    #[test]
    fn tick_size_overrides_win() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("BROKER_URL", "redis://127.0.0.1:6379");
        env::set_var("TICK_SIZES", "DOGEUSDT=0.00001");
        let cfg = Config::from_env().unwrap();
        assert!((cfg.tick_size("DOGEUSDT") - 0.00001).abs() < 1e-12);
        env::remove_var("TICK_SIZES");
        env::remove_var("BROKER_URL");
    }
}
