//! Tape aggregator: sliding-window per-side volume sums over the trade
//! stream, emitted on a fixed tick.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::models::{kind, Side, TapeAggregate, Trade};
use crate::supervisor::TaskState;

use super::{WorkerContext, WorkerStats, DERIVED_MAXLEN, READ_BLOCK_MS, READ_COUNT};

const WORKER: &str = "tape";

/// Pure sliding-window state. Cold start yields empty buckets.
#[derive(Debug)]
pub struct TapeState {
    window_ms: i64,
    trades: VecDeque<(i64, Side, f64)>,
}

impl TapeState {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            trades: VecDeque::new(),
        }
    }

    pub fn push(&mut self, trade: &Trade) {
        self.trades.push_back((trade.ts, trade.side, trade.size));
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(&(ts, _, _)) = self.trades.front() {
            if ts < cutoff {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }

    /// Aggregate the current window. Pure function of the retained trades.
    pub fn aggregate(&mut self, now_ms: i64) -> TapeAggregate {
        self.evict(now_ms);
        let mut buy = 0.0;
        let mut sell = 0.0;
        for &(_, side, size) in &self.trades {
            match side {
                Side::Buy => buy += size,
                Side::Sell => sell += size,
            }
        }
        TapeAggregate {
            ts: now_ms,
            buy_volume: buy,
            sell_volume: sell,
            delta: buy - sell,
            trades: self.trades.len() as u64,
        }
    }
}

pub struct TapeWorker {
    ctx: WorkerContext,
    state: TapeState,
    pub stats: Arc<WorkerStats>,
}

impl TapeWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let window_ms = ctx.cfg.tape_window_ms;
        Self {
            ctx,
            state: TapeState::new(window_ms),
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
            .map_err(|e| anyhow::anyhow!("tape group setup: {e}"))?;

        let mut tick = tokio::time::interval(Duration::from_millis(self.ctx.cfg.tape_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.ctx.registry.set_state(&name, TaskState::Stopped);
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    let agg = self.state.aggregate(now);
                    if let Ok(payload) = serde_json::to_string(&agg) {
                        self.ctx
                            .emit(
                                &self.ctx.instrument.tape_stream(),
                                &self.ctx.instrument.tape_stream(),
                                kind::TAPE,
                                agg.ts,
                                &payload,
                                DERIVED_MAXLEN,
                                &self.stats,
                            )
                            .await;
                    }
                    self.ctx.heartbeat(WORKER).await;
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
                            if entry.kind != kind::TRADE {
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            match serde_json::from_str::<Trade>(&entry.payload) {
                                Ok(trade) => {
                                    self.state.push(&trade);
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

    fn trade(ts: i64, side: Side, size: f64) -> Trade {
        Trade {
            ts,
            trade_id: format!("{ts}"),
            side,
            price: 100.0,
            size,
        }
    }

    #[test]
    fn window_sums_per_side() {
        let mut state = TapeState::new(60_000);
        state.push(&trade(1_000, Side::Buy, 2.0));
        state.push(&trade(2_000, Side::Sell, 0.5));
        state.push(&trade(3_000, Side::Buy, 1.0));

        let agg = state.aggregate(10_000);
        assert_eq!(agg.buy_volume, 3.0);
        assert_eq!(agg.sell_volume, 0.5);
        assert_eq!(agg.delta, 2.5);
        assert_eq!(agg.trades, 3);
    }

    #[test]
    fn old_trades_roll_out_of_the_window() {
        let mut state = TapeState::new(60_000);
        state.push(&trade(0, Side::Buy, 5.0));
        state.push(&trade(50_000, Side::Sell, 1.0));

        let agg = state.aggregate(70_000);
        assert_eq!(agg.buy_volume, 0.0);
        assert_eq!(agg.sell_volume, 1.0);
        assert_eq!(agg.trades, 1);
    }

    #[test]
    fn cold_start_is_empty_buckets() {
        let mut state = TapeState::new(60_000);
        let agg = state.aggregate(1_000);
        assert_eq!(agg.buy_volume, 0.0);
        assert_eq!(agg.sell_volume, 0.0);
        assert_eq!(agg.trades, 0);
    }
}
