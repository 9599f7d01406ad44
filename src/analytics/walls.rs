//! Wall/spoof detector: flags abnormally large resting levels and walls
//! that vanish untouched.
//!
//! A wall is a level at least `X ×` the median visible size of its depth
//! band that stays resident for `T1`. A spoof is a wall-sized level that is
//! removed or shrunk by ≥ 80 % within `T2` of its peak, with no trade at or
//! through the price in that interval.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::ingest::book::{key_price, price_key};
use crate::models::{kind, DomSnapshot, EventKind, MarketEvent, Side, Trade};
use crate::supervisor::TaskState;

use super::{WorkerContext, WorkerStats, DERIVED_MAXLEN, READ_BLOCK_MS, READ_COUNT};

const WORKER: &str = "walls";
/// Levels per side considered the depth band for the median.
const BAND_DEPTH: usize = 20;
/// A wall counts as vanished when it shrinks below this fraction of peak.
const SPOOF_REMAINDER: f64 = 0.2;
/// Trades are retained this many multiples of T2 for the spoof check.
const TRADE_HORIZON_MULT: i64 = 4;

#[derive(Debug, Clone)]
struct LevelResidency {
    first_seen: i64,
    max_size: f64,
    max_size_ts: i64,
    /// Set once the level crossed the wall size threshold.
    wall_sized: bool,
    wall_emitted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct WallParams {
    pub x: f64,
    pub t1_ms: i64,
    pub t2_ms: i64,
}

/// Pure detection state over DOM updates and trades.
#[derive(Debug)]
pub struct WallState {
    params: WallParams,
    levels: HashMap<(Side, i64), LevelResidency>,
    trades: VecDeque<(i64, f64, Side)>,
}

impl WallState {
    pub fn new(params: WallParams) -> Self {
        Self {
            params,
            levels: HashMap::new(),
            trades: VecDeque::new(),
        }
    }

    pub fn on_trade(&mut self, trade: &Trade) {
        self.trades.push_back((trade.ts, trade.price, trade.side));
        let horizon = self.params.t2_ms * TRADE_HORIZON_MULT;
        while let Some(&(ts, _, _)) = self.trades.front() {
            if trade.ts - ts > horizon {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }

    /// True if any trade since `since_ts` printed at or through `price` on
    /// the given book side (for a bid: at or below; for an ask: at or above).
    fn traded_through(&self, side: Side, price: f64, since_ts: i64) -> bool {
        self.trades.iter().any(|&(ts, p, _)| {
            ts >= since_ts
                && match side {
                    Side::Buy => p <= price + f64::EPSILON,
                    Side::Sell => p >= price - f64::EPSILON,
                }
        })
    }

    pub fn on_dom(&mut self, dom: &DomSnapshot) -> Vec<MarketEvent> {
        let mut events = Vec::new();
        for (side, book_levels) in [(Side::Buy, &dom.bids), (Side::Sell, &dom.asks)] {
            let band: Vec<f64> = book_levels
                .iter()
                .take(BAND_DEPTH)
                .map(|&(_, size)| size)
                .collect();
            let median = median(&band);

            let mut present: HashMap<i64, f64> = HashMap::with_capacity(band.len());
            for &(price, size) in book_levels.iter().take(BAND_DEPTH) {
                present.insert(price_key(price), size);
            }

            // Update or create residency for levels in the band.
            for (&pk, &size) in &present {
                let entry = self.levels.entry((side, pk)).or_insert(LevelResidency {
                    first_seen: dom.ts,
                    max_size: size,
                    max_size_ts: dom.ts,
                    wall_sized: false,
                    wall_emitted: false,
                });
                if size > entry.max_size {
                    entry.max_size = size;
                    entry.max_size_ts = dom.ts;
                }
                if median > 0.0 && size >= self.params.x * median {
                    entry.wall_sized = true;
                    if !entry.wall_emitted && dom.ts - entry.first_seen >= self.params.t1_ms {
                        entry.wall_emitted = true;
                        events.push(MarketEvent {
                            kind: EventKind::Wall,
                            ts: dom.ts,
                            side,
                            price: key_price(pk),
                            payload: serde_json::json!({
                                "size": size,
                                "band_median": median,
                                "residency_ms": dom.ts - entry.first_seen,
                            }),
                        });
                    }
                }
            }

            // Check watched levels of this side that vanished or shrank.
            let keys: Vec<(Side, i64)> = self
                .levels
                .keys()
                .filter(|(s, _)| *s == side)
                .copied()
                .collect();
            for key in keys {
                let (_, pk) = key;
                let current = present.get(&pk).copied();
                let entry = self.levels.get(&key).cloned();
                let Some(entry) = entry else { continue };

                let vanished = match current {
                    None => true,
                    Some(size) => size <= SPOOF_REMAINDER * entry.max_size,
                };
                if !vanished {
                    continue;
                }

                if entry.wall_sized
                    && dom.ts - entry.max_size_ts <= self.params.t2_ms
                    && !self.traded_through(side, key_price(pk), entry.max_size_ts)
                {
                    events.push(MarketEvent {
                        kind: EventKind::Spoof,
                        ts: dom.ts,
                        side,
                        price: key_price(pk),
                        payload: serde_json::json!({
                            "peak_size": entry.max_size,
                            "remaining": current.unwrap_or(0.0),
                            "lifetime_ms": dom.ts - entry.first_seen,
                        }),
                    });
                    self.levels.remove(&key);
                } else if current.is_none() {
                    // Gone without spoof conditions: forget it.
                    self.levels.remove(&key);
                }
            }
        }
        events
    }

    #[cfg(test)]
    fn watched(&self) -> usize {
        self.levels.len()
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub struct WallWorker {
    ctx: WorkerContext,
    state: WallState,
    pub stats: Arc<WorkerStats>,
}

impl WallWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let state = WallState::new(WallParams {
            x: ctx.cfg.wall_x,
            t1_ms: ctx.cfg.wall_t1_ms,
            t2_ms: ctx.cfg.spoof_t2_ms,
        });
        Self {
            ctx,
            state,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    async fn emit_event(&self, event: &MarketEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            self.ctx
                .emit(
                    &self.ctx.instrument.events_stream(),
                    &self.ctx.instrument.events_stream(),
                    kind::EVENT,
                    event.ts,
                    &payload,
                    DERIVED_MAXLEN,
                    &self.stats,
                )
                .await;
        }
    }

    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.ctx.task_name(WORKER);
        self.ctx.registry.set_state(&name, TaskState::Running);

        let streams = vec![
            self.ctx.instrument.dom_stream(),
            self.ctx.instrument.trades_stream(),
        ];
        let consumer = self.ctx.consumer_name(WORKER);
        let mut reader = self
            .ctx
            .broker
            .group_reader(WORKER, &consumer, streams)
            .await
            .map_err(|e| anyhow::anyhow!("walls group setup: {e}"))?;

        let mut hb_tick = tokio::time::interval(Duration::from_secs(2));
        hb_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.ctx.registry.set_state(&name, TaskState::Stopped);
                        return Ok(());
                    }
                }
                _ = hb_tick.tick() => {
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
                            self.stats.processed.fetch_add(1, Ordering::Relaxed);
                            match entry.kind.as_str() {
                                kind::DOM => match serde_json::from_str::<DomSnapshot>(&entry.payload) {
                                    Ok(dom) => {
                                        for ev in self.state.on_dom(&dom) {
                                            self.emit_event(&ev).await;
                                        }
                                    }
                                    Err(e) => {
                                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                        warn!(task = %name, error = %e, "bad dom record");
                                    }
                                },
                                kind::TRADE => match serde_json::from_str::<Trade>(&entry.payload) {
                                    Ok(trade) => self.state.on_trade(&trade),
                                    Err(e) => {
                                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                        warn!(task = %name, error = %e, "bad trade record");
                                    }
                                },
                                other => {
                                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                    warn!(task = %name, kind = other, "unknown record kind");
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

    fn params() -> WallParams {
        WallParams {
            x: 10.0,
            t1_ms: 5_000,
            t2_ms: 1_000,
        }
    }

    /// Bid book: one big level at 99.0 plus filler levels of size ~20.
    fn dom_with_wall(ts: i64, wall_size: f64) -> DomSnapshot {
        let mut bids = vec![(99.5, 20.0), (99.0, wall_size), (98.5, 20.0), (98.0, 20.0)];
        bids.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        DomSnapshot {
            ts,
            update_id: ts,
            bids,
            asks: vec![(100.0, 20.0), (100.5, 20.0)],
        }
    }

    #[test]
    fn spoof_on_untouched_vanishing_wall() {
        // 500 against a band median of 20 with X=10; shrinks to 10 at
        // t0+400 with no trade at or below 99.0 and T2=1000.
        let mut state = WallState::new(params());
        assert!(state.on_dom(&dom_with_wall(T0, 500.0)).is_empty());

        let events = state.on_dom(&dom_with_wall(T0 + 400, 10.0));
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.kind, EventKind::Spoof);
        assert_eq!(ev.side, Side::Buy);
        assert_eq!(ev.price, 99.0);
    }

    #[test]
    fn no_spoof_when_trades_went_through() {
        let mut state = WallState::new(params());
        state.on_dom(&dom_with_wall(T0, 500.0));
        // A sell printed at the level: consumption, not spoofing.
        state.on_trade(&Trade {
            ts: T0 + 200,
            trade_id: "x".to_string(),
            side: Side::Sell,
            price: 99.0,
            size: 400.0,
        });
        let events = state.on_dom(&dom_with_wall(T0 + 400, 10.0));
        assert!(events.is_empty());
    }

    #[test]
    fn no_spoof_outside_t2() {
        let mut state = WallState::new(params());
        state.on_dom(&dom_with_wall(T0, 500.0));
        let events = state.on_dom(&dom_with_wall(T0 + 1_500, 10.0));
        assert!(events.is_empty());
    }

    #[test]
    fn wall_requires_residency() {
        let mut state = WallState::new(params());
        assert!(state.on_dom(&dom_with_wall(T0, 500.0)).is_empty());
        assert!(state.on_dom(&dom_with_wall(T0 + 2_000, 500.0)).is_empty());

        let events = state.on_dom(&dom_with_wall(T0 + 5_000, 500.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Wall);
        assert_eq!(events[0].price, 99.0);

        // emitted once, not on every later update
        assert!(state.on_dom(&dom_with_wall(T0 + 6_000, 500.0)).is_empty());
    }

    #[test]
    fn normal_levels_never_trigger() {
        let mut state = WallState::new(params());
        for i in 0..10 {
            let events = state.on_dom(&dom_with_wall(T0 + i * 1_000, 25.0));
            assert!(events.is_empty());
        }
    }

    #[test]
    fn vanished_non_wall_levels_are_forgotten() {
        let mut state = WallState::new(params());
        state.on_dom(&dom_with_wall(T0, 25.0));
        let watched_before = state.watched();
        // 99.0 disappears entirely from the band
        let dom = DomSnapshot {
            ts: T0 + 100,
            update_id: 1,
            bids: vec![(99.5, 20.0), (98.5, 20.0), (98.0, 20.0)],
            asks: vec![(100.0, 20.0), (100.5, 20.0)],
        };
        state.on_dom(&dom);
        assert!(state.watched() < watched_before);
    }

    #[test]
    fn median_of_band() {
        assert_eq!(median(&[20.0, 500.0, 20.0, 20.0]), 20.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }
}
