//! WebSocket/REST gateway: one subscription per client fanned across the
//! broker's pub/sub channels, plus broker-backed history endpoints.

pub mod ws;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::config::Config;
use crate::hotstore::DomTable;
use crate::models::{DomSnapshot, Exchange, Instrument, Kline, Liquidation, OpenInterest, Trade};
use crate::supervisor::{TaskHealth, TaskRegistry};

const HISTORY_LIMIT_CAP: usize = 1_000;
const MINUTE_MS: i64 = 60_000;

#[derive(Clone)]
pub struct GatewayState {
    pub broker: Broker,
    pub cfg: Arc<Config>,
    pub registry: TaskRegistry,
    pub doms: DomTable,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/dom/:exchange/:symbol", get(get_dom))
        .route("/trades/:exchange/:symbol", get(get_trades))
        .route("/kline/:exchange/:symbol", get(get_kline))
        .route("/oi/:exchange/:symbol", get(get_oi))
        .route("/liquidations/:exchange/:symbol", get(get_liquidations))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    tasks: Vec<TaskHealth>,
}

async fn get_health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let tasks = state.registry.snapshot();
    let status = if state
        .registry
        .all_healthy(std::time::Duration::from_secs(30))
    {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse { status, tasks })
}

fn parse_instrument(exchange: &str, symbol: &str) -> Result<Instrument, StatusCode> {
    let exchange: Exchange = exchange.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Instrument::new(exchange, symbol.to_uppercase()))
}

async fn get_dom(
    Path((exchange, symbol)): Path<(String, String)>,
    State(state): State<GatewayState>,
) -> Result<Json<DomSnapshot>, StatusCode> {
    let inst = parse_instrument(&exchange, &symbol)?;

    // In-process table first, KV as fallback after a hot-store restart.
    if let Some(dom) = state.doms.get(inst.exchange, &inst.symbol) {
        return Ok(Json(dom));
    }
    match state.broker.kv_get(&inst.dom_key()).await {
        Ok(Some(raw)) => serde_json::from_str(&raw)
            .map(Json)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

fn capped_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(100).clamp(1, HISTORY_LIMIT_CAP)
}

/// Newest-first typed read of a stream tail.
async fn read_history<T: serde::de::DeserializeOwned>(
    broker: &Broker,
    stream: &str,
    limit: usize,
) -> Result<Vec<T>, StatusCode> {
    let entries = broker
        .stream_tail(stream, limit)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(entries
        .iter()
        .filter_map(|e| serde_json::from_str(&e.payload).ok())
        .collect())
}

async fn get_trades(
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    State(state): State<GatewayState>,
) -> Result<Json<Vec<Trade>>, StatusCode> {
    let inst = parse_instrument(&exchange, &symbol)?;
    let trades = read_history(
        &state.broker,
        &inst.trades_stream(),
        capped_limit(query.limit),
    )
    .await?;
    Ok(Json(trades))
}

async fn get_oi(
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    State(state): State<GatewayState>,
) -> Result<Json<Vec<OpenInterest>>, StatusCode> {
    let inst = parse_instrument(&exchange, &symbol)?;
    let points = read_history(&state.broker, &inst.oi_stream(), capped_limit(query.limit)).await?;
    Ok(Json(points))
}

async fn get_liquidations(
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    State(state): State<GatewayState>,
) -> Result<Json<Vec<Liquidation>>, StatusCode> {
    let inst = parse_instrument(&exchange, &symbol)?;
    let liqs = read_history(&state.broker, &inst.liq_stream(), capped_limit(query.limit)).await?;
    Ok(Json(liqs))
}

#[derive(Debug, Deserialize)]
struct KlineQuery {
    interval: Option<i64>,
    limit: Option<usize>,
}

async fn get_kline(
    Path((exchange, symbol)): Path<(String, String)>,
    Query(query): Query<KlineQuery>,
    State(state): State<GatewayState>,
) -> Result<Json<Vec<Kline>>, StatusCode> {
    let inst = parse_instrument(&exchange, &symbol)?;
    let interval_min = query.interval.unwrap_or(1).max(1);
    let limit = capped_limit(query.limit);

    // The stream carries 1m updates (unconfirmed candles repeat per start);
    // over-read so aggregation has enough distinct minutes.
    let raw_limit = (limit * interval_min as usize * 4).min(10_000);
    let raw: Vec<Kline> = read_history(&state.broker, &inst.kline_stream(), raw_limit).await?;

    Ok(Json(aggregate_klines(raw, interval_min, limit)))
}

/// Fold newest-first 1m candle updates into M-minute buckets, newest-first.
/// Later updates of the same 1m candle supersede earlier ones; confirmed
/// candles are immutable so first-seen (newest) wins.
fn aggregate_klines(newest_first: Vec<Kline>, interval_min: i64, limit: usize) -> Vec<Kline> {
    use std::collections::BTreeMap;

    // Dedup 1m candles by start, keeping the newest record.
    let mut minutes: BTreeMap<i64, Kline> = BTreeMap::new();
    for k in newest_first {
        minutes.entry(k.start).or_insert(k);
    }

    let bucket_ms = interval_min * MINUTE_MS;
    let mut buckets: BTreeMap<i64, Kline> = BTreeMap::new();
    for (_, k) in minutes {
        let bucket_start = k.start.div_euclid(bucket_ms) * bucket_ms;
        match buckets.get_mut(&bucket_start) {
            None => {
                buckets.insert(
                    bucket_start,
                    Kline {
                        start: bucket_start,
                        end: bucket_start + bucket_ms,
                        open: k.open,
                        high: k.high,
                        low: k.low,
                        close: k.close,
                        volume: k.volume,
                        confirm: k.confirm && k.end == bucket_start + bucket_ms,
                    },
                );
            }
            Some(b) => {
                // minutes iterate oldest-first inside the bucket
                b.high = b.high.max(k.high);
                b.low = b.low.min(k.low);
                b.close = k.close;
                b.volume += k.volume;
                b.confirm = k.confirm && k.end == bucket_start + bucket_ms;
            }
        }
    }

    buckets.into_values().rev().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(start: i64, open: f64, high: f64, low: f64, close: f64, vol: f64, confirm: bool) -> Kline {
        Kline {
            start,
            end: start + MINUTE_MS,
            open,
            high,
            low,
            close,
            volume: vol,
            confirm,
        }
    }

    #[test]
    fn aggregation_folds_minutes_into_buckets() {
        // three 1m candles -> one 3m bucket
        let newest_first = vec![
            k(2 * MINUTE_MS, 102.0, 106.0, 101.0, 105.0, 3.0, true),
            k(MINUTE_MS, 101.0, 103.0, 99.0, 102.0, 2.0, true),
            k(0, 100.0, 104.0, 98.0, 101.0, 1.0, true),
        ];
        let out = aggregate_klines(newest_first, 3, 10);
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert_eq!(b.start, 0);
        assert_eq!(b.end, 3 * MINUTE_MS);
        assert_eq!(b.open, 100.0);
        assert_eq!(b.high, 106.0);
        assert_eq!(b.low, 98.0);
        assert_eq!(b.close, 105.0);
        assert_eq!(b.volume, 6.0);
        assert!(b.confirm);
    }

    #[test]
    fn unconfirmed_updates_are_superseded_by_newer_records() {
        // Two records for the same minute: the newer one (earlier in the
        // newest-first vec) wins.
        let newest_first = vec![
            k(0, 100.0, 110.0, 95.0, 108.0, 5.0, true),
            k(0, 100.0, 105.0, 98.0, 103.0, 2.0, false),
        ];
        let out = aggregate_klines(newest_first, 1, 10);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].high, 110.0);
        assert_eq!(out[0].volume, 5.0);
        assert!(out[0].confirm);
    }

    #[test]
    fn partial_bucket_is_not_confirmed() {
        // Only two of three minutes present: close comes from the last
        // minute seen, confirm stays false.
        let newest_first = vec![
            k(MINUTE_MS, 101.0, 103.0, 99.0, 102.0, 2.0, true),
            k(0, 100.0, 104.0, 98.0, 101.0, 1.0, true),
        ];
        let out = aggregate_klines(newest_first, 3, 10);
        assert_eq!(out.len(), 1);
        assert!(!out[0].confirm);
        assert_eq!(out[0].close, 102.0);
    }

    #[test]
    fn limit_keeps_newest_buckets() {
        let newest_first: Vec<Kline> = (0..10)
            .rev()
            .map(|i| k(i * MINUTE_MS, 100.0, 101.0, 99.0, 100.5, 1.0, true))
            .collect();
        let out = aggregate_klines(newest_first, 1, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].start, 9 * MINUTE_MS); // newest first
        assert_eq!(out[2].start, 7 * MINUTE_MS);
    }

    #[test]
    fn limits_are_capped() {
        assert_eq!(capped_limit(None), 100);
        assert_eq!(capped_limit(Some(5)), 5);
        assert_eq!(capped_limit(Some(10_000)), HISTORY_LIMIT_CAP);
        assert_eq!(capped_limit(Some(0)), 1);
    }
}
