//! Heatmap aggregator: periodic DOM sampling binned by price.
//!
//! The bin size comes from one place only — `Config::bin_size` (instrument
//! tick size × multiplier). Re-binning the same DOM with the same bin size
//! is deterministic down to the byte.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::ingest::book::{key_price, price_key};
use crate::models::{kind, DomSnapshot, HeatmapRow, HeatmapSlice};
use crate::supervisor::TaskState;

use super::{WorkerContext, WorkerStats};

const WORKER: &str = "heatmap";

/// Bin a DOM snapshot: `bin = round(price / bin_size) * bin_size`, rows
/// ordered by bin ascending. Pure.
pub fn bin_dom(dom: &DomSnapshot, bin_size: f64) -> HeatmapSlice {
    let mut rows: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for &(price, size) in &dom.bids {
        let bin = (price / bin_size).round() * bin_size;
        rows.entry(price_key(bin)).or_insert((0.0, 0.0)).0 += size;
    }
    for &(price, size) in &dom.asks {
        let bin = (price / bin_size).round() * bin_size;
        rows.entry(price_key(bin)).or_insert((0.0, 0.0)).1 += size;
    }
    HeatmapSlice {
        ts: dom.ts,
        rows: rows
            .into_iter()
            .map(|(bin_key, (vol_bid, vol_ask))| HeatmapRow {
                bin: key_price(bin_key),
                vol_bid,
                vol_ask,
            })
            .collect(),
    }
}

pub struct HeatmapWorker {
    ctx: WorkerContext,
    bin_size: f64,
    pub stats: Arc<WorkerStats>,
}

impl HeatmapWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let bin_size = ctx.cfg.bin_size(&ctx.instrument.symbol);
        Self {
            ctx,
            bin_size,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.ctx.task_name(WORKER);
        self.ctx.registry.set_state(&name, TaskState::Running);

        let mut tick =
            tokio::time::interval(Duration::from_millis(self.ctx.cfg.heatmap_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_sampled_ts: i64 = 0;

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.ctx.registry.set_state(&name, TaskState::Stopped);
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    self.ctx.heartbeat(WORKER).await;
                    let dom_json = match self.ctx.broker.kv_get(&self.ctx.instrument.dom_key()).await {
                        Ok(Some(v)) => v,
                        Ok(None) => continue, // book not live yet or TTL'd out
                        Err(e) => {
                            warn!(task = %name, error = %e, "dom kv read failed");
                            continue;
                        }
                    };
                    let dom: DomSnapshot = match serde_json::from_str(&dom_json) {
                        Ok(d) => d,
                        Err(e) => {
                            self.stats.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            warn!(task = %name, error = %e, "bad dom payload");
                            continue;
                        }
                    };
                    if dom.ts == last_sampled_ts {
                        continue; // book unchanged since last slice
                    }
                    last_sampled_ts = dom.ts;

                    let slice = bin_dom(&dom, self.bin_size);
                    if let Ok(payload) = serde_json::to_string(&slice) {
                        self.ctx
                            .emit(
                                &self.ctx.instrument.heatmap_stream(),
                                &self.ctx.instrument.heatmap_stream(),
                                kind::HEATMAP,
                                slice.ts,
                                &payload,
                                self.ctx.cfg.heatmap_stream_maxlen,
                                &self.stats,
                            )
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom() -> DomSnapshot {
        DomSnapshot {
            ts: 1_700_000_000_000,
            update_id: 42,
            bids: vec![(100.04, 1.0), (100.01, 2.0), (99.96, 3.0)],
            asks: vec![(100.12, 4.0), (100.14, 5.0)],
        }
    }

    #[test]
    fn prices_are_binned_and_summed_per_side() {
        let slice = bin_dom(&dom(), 0.1);
        // 100.04 -> 100.0, 100.01 -> 100.0, 99.96 -> 100.0 (round-to-nearest)
        // 100.12 -> 100.1, 100.14 -> 100.1
        assert_eq!(slice.rows.len(), 2);
        assert_eq!(slice.rows[0].bin, 100.0);
        assert_eq!(slice.rows[0].vol_bid, 6.0);
        assert_eq!(slice.rows[0].vol_ask, 0.0);
        assert_eq!(slice.rows[1].bin, 100.1);
        assert_eq!(slice.rows[1].vol_ask, 9.0);
    }

    #[test]
    fn rebinning_the_same_dom_is_byte_identical() {
        let a = serde_json::to_string(&bin_dom(&dom(), 0.1)).unwrap();
        let b = serde_json::to_string(&bin_dom(&dom(), 0.1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rows_are_ordered_by_bin() {
        let slice = bin_dom(&dom(), 0.01);
        let bins: Vec<f64> = slice.rows.iter().map(|r| r.bin).collect();
        let mut sorted = bins.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(bins, sorted);
    }
}
