//! Footprint aggregator: time-bucketed trades grouped by price with
//! bid/ask volume, delta, POC and imbalance levels.
//!
//! Bars are immutable once emitted; trades for an already-closed bar are
//! dropped and counted.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::ingest::book::{key_price, price_key};
use crate::models::{kind, FootprintBar, FootprintLevel, Side, Trade};
use crate::supervisor::TaskState;

use super::{WorkerContext, WorkerStats, DERIVED_MAXLEN, READ_BLOCK_MS, READ_COUNT};

const WORKER: &str = "footprint";
const CLOSE_POLL: Duration = Duration::from_millis(500);

/// Pure bar-building state.
#[derive(Debug)]
pub struct FootprintState {
    bar_ms: i64,
    imbalance_ratio: f64,
    /// bar_start -> price_key -> (vol_bid, vol_ask)
    bars: BTreeMap<i64, BTreeMap<i64, (f64, f64)>>,
    /// Highest bar_start that has been emitted; anything at or below is
    /// closed and must never change.
    emitted_through: i64,
    pub late_trades: u64,
}

impl FootprintState {
    pub fn new(bar_ms: i64, imbalance_ratio: f64) -> Self {
        Self {
            bar_ms,
            imbalance_ratio,
            bars: BTreeMap::new(),
            emitted_through: i64::MIN,
            late_trades: 0,
        }
    }

    pub fn bar_start(&self, ts: i64) -> i64 {
        ts.div_euclid(self.bar_ms) * self.bar_ms
    }

    /// Accumulate one trade. Returns false when the trade was late (its
    /// bar is already published) and therefore dropped.
    pub fn on_trade(&mut self, trade: &Trade) -> bool {
        let start = self.bar_start(trade.ts);
        if start <= self.emitted_through {
            self.late_trades += 1;
            return false;
        }
        let level = self
            .bars
            .entry(start)
            .or_default()
            .entry(price_key(trade.price))
            .or_insert((0.0, 0.0));
        match trade.side {
            // Buyers lift the ask, sellers hit the bid.
            Side::Buy => level.1 += trade.size,
            Side::Sell => level.0 += trade.size,
        }
        true
    }

    /// Close every bar whose window has passed. Bars come out ordered by
    /// start time.
    pub fn close_due(&mut self, now_ms: i64) -> Vec<FootprintBar> {
        let due: Vec<i64> = self
            .bars
            .keys()
            .copied()
            .filter(|start| start + self.bar_ms <= now_ms)
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for start in due {
            let levels = self.bars.remove(&start).unwrap_or_default();
            out.push(self.build_bar(start, levels));
            self.emitted_through = self.emitted_through.max(start);
        }
        out
    }

    fn build_bar(&self, start: i64, levels: BTreeMap<i64, (f64, f64)>) -> FootprintBar {
        let mut built = Vec::with_capacity(levels.len());
        let mut poc_price = None;
        let mut poc_volume = f64::NEG_INFINITY;
        let mut imbalance_levels = Vec::new();

        for (key, (vol_bid, vol_ask)) in levels {
            let price = key_price(key);
            let total = vol_bid + vol_ask;
            if total > poc_volume {
                poc_volume = total;
                poc_price = Some(price);
            }
            let hi = vol_bid.max(vol_ask);
            let lo = vol_bid.min(vol_ask);
            let imbalanced = if lo == 0.0 {
                hi > 0.0 // one-sided level dominates by definition
            } else {
                hi / lo >= self.imbalance_ratio
            };
            if imbalanced {
                imbalance_levels.push(price);
            }
            built.push(FootprintLevel {
                price,
                vol_bid,
                vol_ask,
                delta: vol_ask - vol_bid,
            });
        }

        FootprintBar {
            start,
            end: start + self.bar_ms,
            levels: built,
            poc_price,
            imbalance_levels,
        }
    }
}

pub struct FootprintWorker {
    ctx: WorkerContext,
    state: FootprintState,
    pub stats: Arc<WorkerStats>,
}

impl FootprintWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let state = FootprintState::new(ctx.cfg.footprint_bar_ms, ctx.cfg.imbalance_ratio);
        Self {
            ctx,
            state,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.ctx.task_name(WORKER);
        self.ctx.registry.set_state(&name, TaskState::Running);

        let streams = vec![self.ctx.instrument.trades_stream()];
        let consumer = self.ctx.consumer_name(WORKER);
        let mut reader = self
            .ctx
            .broker
            .group_reader(WORKER, &consumer, streams)
            .await
            .map_err(|e| anyhow::anyhow!("footprint group setup: {e}"))?;

        let mut close_tick = tokio::time::interval(CLOSE_POLL);
        close_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.ctx.registry.set_state(&name, TaskState::Stopped);
                        return Ok(());
                    }
                }
                _ = close_tick.tick() => {
                    self.ctx.heartbeat(WORKER).await;
                    let now = chrono::Utc::now().timestamp_millis();
                    for bar in self.state.close_due(now) {
                        if let Ok(payload) = serde_json::to_string(&bar) {
                            self.ctx
                                .emit(
                                    &self.ctx.instrument.footprint_stream(),
                                    &self.ctx.instrument.footprint_stream(),
                                    kind::FOOTPRINT,
                                    bar.start,
                                    &payload,
                                    DERIVED_MAXLEN,
                                    &self.stats,
                                )
                                .await;
                        }
                    }
                }
                batches = reader.read(READ_BLOCK_MS, READ_COUNT) => {
                    let batches = match batches {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(task = %name, error = %e, "read failed, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    for batch in batches {
                        let mut ids = Vec::with_capacity(batch.entries.len());
                        for entry in &batch.entries {
                            ids.push(entry.id.clone());
                            match serde_json::from_str::<Trade>(&entry.payload) {
                                Ok(trade) => {
                                    self.state.on_trade(&trade);
                                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                    warn!(task = %name, error = %e, "bad trade record");
                                }
                            }
                        }
                        if let Err(e) = reader.ack(&batch.stream, &ids).await {
                            warn!(task = %name, error = %e, "ack failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn trade(ts: i64, side: Side, price: f64, size: f64) -> Trade {
        Trade {
            ts,
            trade_id: format!("{ts}-{price}"),
            side,
            price,
            size,
        }
    }

    #[test]
    fn bar_levels_delta_and_poc() {
        let mut state = FootprintState::new(60_000, 3.0);
        assert!(state.on_trade(&trade(T0 + 5, Side::Buy, 100.0, 2.0)));
        assert!(state.on_trade(&trade(T0 + 6, Side::Sell, 100.0, 1.0)));
        assert!(state.on_trade(&trade(T0 + 100, Side::Buy, 100.5, 4.0)));

        let bars = state.close_due(T0 + 60_000);
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.start, T0);
        assert_eq!(bar.end, T0 + 60_000);
        assert_eq!(
            bar.levels,
            vec![
                FootprintLevel {
                    price: 100.0,
                    vol_bid: 1.0,
                    vol_ask: 2.0,
                    delta: 1.0
                },
                FootprintLevel {
                    price: 100.5,
                    vol_bid: 0.0,
                    vol_ask: 4.0,
                    delta: 4.0
                },
            ]
        );
        assert_eq!(bar.poc_price, Some(100.5));
        // 100.0: 2/1 < 3 not imbalanced; 100.5 one-sided -> imbalanced
        assert_eq!(bar.imbalance_levels, vec![100.5]);
    }

    #[test]
    fn closed_bars_are_immutable_and_late_trades_counted() {
        let mut state = FootprintState::new(60_000, 3.0);
        state.on_trade(&trade(T0 + 10, Side::Buy, 100.0, 1.0));
        let bars = state.close_due(T0 + 60_000);
        assert_eq!(bars.len(), 1);

        // a late trade for the closed bar is dropped, not merged
        assert!(!state.on_trade(&trade(T0 + 50, Side::Buy, 100.0, 99.0)));
        assert_eq!(state.late_trades, 1);
        assert!(state.close_due(T0 + 120_000).is_empty());
    }

    #[test]
    fn open_bar_is_not_closed_early() {
        let mut state = FootprintState::new(60_000, 3.0);
        state.on_trade(&trade(T0 + 10, Side::Buy, 100.0, 1.0));
        assert!(state.close_due(T0 + 59_999).is_empty());
        assert_eq!(state.close_due(T0 + 60_000).len(), 1);
    }

    #[test]
    fn trades_split_across_bars() {
        let mut state = FootprintState::new(60_000, 3.0);
        state.on_trade(&trade(T0 + 10, Side::Buy, 100.0, 1.0));
        state.on_trade(&trade(T0 + 60_010, Side::Sell, 100.0, 2.0));

        let bars = state.close_due(T0 + 120_000);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].start, T0);
        assert_eq!(bars[1].start, T0 + 60_000);
        assert_eq!(bars[0].levels[0].vol_ask, 1.0);
        assert_eq!(bars[1].levels[0].vol_bid, 2.0);
    }

    #[test]
    fn imbalance_ratio_threshold() {
        let mut state = FootprintState::new(60_000, 3.0);
        state.on_trade(&trade(T0, Side::Buy, 100.0, 9.0));
        state.on_trade(&trade(T0, Side::Sell, 100.0, 3.0)); // exactly 3:1
        state.on_trade(&trade(T0, Side::Buy, 101.0, 5.0));
        state.on_trade(&trade(T0, Side::Sell, 101.0, 2.0)); // 2.5:1

        let bars = state.close_due(T0 + 60_000);
        assert_eq!(bars[0].imbalance_levels, vec![100.0]);
    }
}
