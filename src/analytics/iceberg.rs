//! Iceberg detector: infers replenishing hidden orders from the ratio of
//! consumed volume to visible size at a price, plus repeated refills.
//!
//! Consumes both the trade stream (consumption) and the DOM stream
//! (visible-size observations) through one consumer group.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::ingest::book::price_key;
use crate::models::{kind, DomSnapshot, EventKind, MarketEvent, Side, Trade};
use crate::supervisor::TaskState;

use super::{WorkerContext, WorkerStats, DERIVED_MAXLEN, READ_BLOCK_MS, READ_COUNT};

const WORKER: &str = "iceberg";
const GC_POLL: Duration = Duration::from_secs(5);
const VISIBLE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct LevelWatch {
    visible_last: f64,
    visible_max: f64,
    consumed: f64,
    /// Consumption since the last DOM observation; a size increase after
    /// non-zero consumption is a replenish.
    consumed_since_obs: f64,
    replenish_count: u32,
    first_ts: i64,
    last_ts: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct IcebergParams {
    pub k: f64,
    pub r: u32,
    pub window_ms: i64,
}

/// Pure detection state, driven by trades and DOM samples.
#[derive(Debug)]
pub struct IcebergState {
    params: IcebergParams,
    /// Keyed by (book side, price). A bid iceberg is consumed by sell
    /// trades, so the state side is the opposite of the trade side.
    levels: HashMap<(Side, i64), LevelWatch>,
    /// Emitted levels sit out one window before they can re-trigger.
    cooldowns: HashMap<(Side, i64), i64>,
}

impl IcebergState {
    pub fn new(params: IcebergParams) -> Self {
        Self {
            params,
            levels: HashMap::new(),
            cooldowns: HashMap::new(),
        }
    }

    fn in_cooldown(&mut self, key: (Side, i64), ts: i64) -> bool {
        match self.cooldowns.get(&key) {
            Some(&until) if ts < until => true,
            Some(_) => {
                self.cooldowns.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn on_trade(&mut self, trade: &Trade) -> Option<MarketEvent> {
        let book_side = trade.side.opposite();
        let key = (book_side, price_key(trade.price));
        if self.in_cooldown(key, trade.ts) {
            return None;
        }
        let watch = self.levels.entry(key).or_insert(LevelWatch {
            visible_last: 0.0,
            visible_max: 0.0,
            consumed: 0.0,
            consumed_since_obs: 0.0,
            replenish_count: 0,
            first_ts: trade.ts,
            last_ts: trade.ts,
        });
        watch.consumed += trade.size;
        watch.consumed_since_obs += trade.size;
        watch.last_ts = trade.ts;
        self.check(book_side, trade.price, trade.ts)
    }

    pub fn on_dom(&mut self, dom: &DomSnapshot) -> Vec<MarketEvent> {
        let mut events = Vec::new();
        for (side, levels) in [(Side::Buy, &dom.bids), (Side::Sell, &dom.asks)] {
            for &(price, size) in levels {
                let key = (side, price_key(price));
                if self.in_cooldown(key, dom.ts) {
                    continue;
                }
                let Some(watch) = self.levels.get_mut(&key) else {
                    continue; // only trade-active prices are watched
                };
                if size > watch.visible_last + VISIBLE_EPSILON
                    && watch.consumed_since_obs > 0.0
                {
                    watch.replenish_count += 1;
                }
                watch.consumed_since_obs = 0.0;
                watch.visible_max = watch.visible_max.max(size);
                watch.visible_last = size;
                watch.last_ts = watch.last_ts.max(dom.ts);
                if let Some(ev) = self.check(side, price, dom.ts) {
                    events.push(ev);
                }
            }
        }
        events
    }

    fn check(&mut self, side: Side, price: f64, ts: i64) -> Option<MarketEvent> {
        let key = (side, price_key(price));
        let watch = self.levels.get(&key)?;
        if watch.replenish_count < self.params.r {
            return None;
        }
        if ts - watch.first_ts > self.params.window_ms {
            return None;
        }
        let ratio = watch.consumed / watch.visible_max.max(VISIBLE_EPSILON);
        if ratio < self.params.k {
            return None;
        }
        let payload = serde_json::json!({
            "consumed": watch.consumed,
            "visible_max": watch.visible_max,
            "replenishes": watch.replenish_count,
        });
        // One event per detection; the level sits out a full window before
        // a fresh cycle can accumulate.
        self.levels.remove(&key);
        self.cooldowns.insert(key, ts + self.params.window_ms);
        Some(MarketEvent {
            kind: EventKind::Iceberg,
            ts,
            side,
            price,
            payload,
        })
    }

    /// Drop levels idle past the window and expired cooldowns.
    pub fn gc(&mut self, now_ms: i64) {
        let window = self.params.window_ms;
        self.levels
            .retain(|_, watch| now_ms - watch.last_ts <= window);
        self.cooldowns.retain(|_, &mut until| until > now_ms);
    }

    #[cfg(test)]
    fn watched(&self) -> usize {
        self.levels.len()
    }
}

pub struct IcebergWorker {
    ctx: WorkerContext,
    state: IcebergState,
    pub stats: Arc<WorkerStats>,
}

impl IcebergWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let state = IcebergState::new(IcebergParams {
            k: ctx.cfg.iceberg_k,
            r: ctx.cfg.iceberg_r,
            window_ms: ctx.cfg.iceberg_window_ms,
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
            self.ctx.instrument.trades_stream(),
            self.ctx.instrument.dom_stream(),
        ];
        let consumer = self.ctx.consumer_name(WORKER);
        let mut reader = self
            .ctx
            .broker
            .group_reader(WORKER, &consumer, streams)
            .await
            .map_err(|e| anyhow::anyhow!("iceberg group setup: {e}"))?;

        let mut gc_tick = tokio::time::interval(GC_POLL);
        gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.ctx.registry.set_state(&name, TaskState::Stopped);
                        return Ok(());
                    }
                }
                _ = gc_tick.tick() => {
                    self.ctx.heartbeat(WORKER).await;
                    self.state.gc(chrono::Utc::now().timestamp_millis());
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
                                kind::TRADE => {
                                    match serde_json::from_str::<Trade>(&entry.payload) {
                                        Ok(trade) => {
                                            if let Some(ev) = self.state.on_trade(&trade) {
                                                self.emit_event(&ev).await;
                                            }
                                        }
                                        Err(e) => {
                                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                            warn!(task = %name, error = %e, "bad trade record");
                                        }
                                    }
                                }
                                kind::DOM => {
                                    match serde_json::from_str::<DomSnapshot>(&entry.payload) {
                                        Ok(dom) => {
                                            for ev in self.state.on_dom(&dom) {
                                                self.emit_event(&ev).await;
                                            }
                                        }
                                        Err(e) => {
                                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                            warn!(task = %name, error = %e, "bad dom record");
                                        }
                                    }
                                }
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

    fn params() -> IcebergParams {
        IcebergParams {
            k: 5.0,
            r: 3,
            window_ms: 60_000,
        }
    }

    fn dom_with_bid(ts: i64, price: f64, size: f64) -> DomSnapshot {
        DomSnapshot {
            ts,
            update_id: ts,
            bids: vec![(price, size)],
            asks: vec![(price + 1.0, 10.0)],
        }
    }

    fn sell(ts: i64, price: f64, size: f64) -> Trade {
        Trade {
            ts,
            trade_id: format!("{ts}"),
            side: Side::Sell,
            price,
            size,
        }
    }

    #[test]
    fn replenishing_bid_is_detected_once() {
        // visible size stays ~5 while 120 contracts trade through the
        // level across 40 s
        let mut state = IcebergState::new(params());
        let mut events = Vec::new();
        let mut ts = T0;

        // Interleave sell trades with DOM samples showing the size refilled.
        for i in 0..10 {
            ts = T0 + i * 4_000;
            if let Some(ev) = state.on_trade(&sell(ts, 100.0, 12.0)) {
                events.push(ev);
            }
            // consumed since last observation, yet visible is back to ~5
            let visible = if i % 2 == 0 { 4.0 } else { 5.0 };
            events.extend(state.on_dom(&dom_with_bid(ts + 100, 100.0, visible)));
        }

        assert_eq!(events.len(), 1, "exactly one ICEBERG event");
        let ev = &events[0];
        assert_eq!(ev.kind, EventKind::Iceberg);
        assert_eq!(ev.side, Side::Buy);
        assert_eq!(ev.price, 100.0);
        assert!(ev.payload["consumed"].as_f64().unwrap() >= 40.0);
        assert!(ev.payload["replenishes"].as_u64().unwrap() >= 3);
    }

    #[test]
    fn no_event_without_replenishment() {
        let mut state = IcebergState::new(params());
        // Plenty of consumption but the visible size only ever shrinks.
        assert!(state.on_trade(&sell(T0, 100.0, 50.0)).is_none());
        assert!(state.on_dom(&dom_with_bid(T0 + 10, 100.0, 5.0)).is_empty());
        assert!(state.on_trade(&sell(T0 + 20, 100.0, 50.0)).is_none());
        assert!(state.on_dom(&dom_with_bid(T0 + 30, 100.0, 2.0)).is_empty());
    }

    #[test]
    fn no_event_when_ratio_is_low() {
        let mut state = IcebergState::new(params());
        let mut events = Vec::new();
        // Replenishes but consumption stays below k * visible.
        for i in 0..5 {
            let ts = T0 + i * 1_000;
            state.on_trade(&sell(ts, 100.0, 1.0));
            events.extend(state.on_dom(&dom_with_bid(ts + 100, 100.0, 5.0)));
        }
        assert!(events.is_empty());
    }

    #[test]
    fn idle_levels_are_garbage_collected() {
        let mut state = IcebergState::new(params());
        state.on_trade(&sell(T0, 100.0, 1.0));
        assert_eq!(state.watched(), 1);
        state.gc(T0 + 61_000);
        assert_eq!(state.watched(), 0);
    }

    #[test]
    fn detection_outside_window_is_suppressed() {
        let mut state = IcebergState::new(params());
        let mut events = Vec::new();
        // Same consumption pattern as the S6 test but stretched so the
        // replenish threshold is only reached outside the window.
        for i in 0..10 {
            let ts = T0 + i * 25_000;
            state.on_trade(&sell(ts, 100.0, 12.0));
            let visible = if i % 2 == 0 { 4.0 } else { 5.0 };
            events.extend(state.on_dom(&dom_with_bid(ts + 100, 100.0, visible)));
        }
        assert!(events.is_empty());
    }
}
