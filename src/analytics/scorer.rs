//! Trend/exhaustion scorer over footprint bars and tape aggregates.
//!
//! The emitted fields are the contract; the weighting is tunable
//! configuration. Trend blends an EMA of per-bar delta imbalance with the
//! tape imbalance, damped by absorption (heavy volume, near-zero delta).
//! Exhaustion fires when an outsized delta is answered by an opposing bar.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::config::ScorerWeights;
use crate::models::{
    kind, FootprintBar, ReversalSignal, ScorePoint, Side, TapeAggregate,
};
use crate::supervisor::TaskState;

use super::{WorkerContext, WorkerStats, DERIVED_MAXLEN, READ_BLOCK_MS, READ_COUNT};

const WORKER: &str = "scores";
const EMA_ALPHA: f64 = 0.3;
const VOLUME_MEMORY: usize = 20;
/// |imbalance| above this marks a one-sided bar for exhaustion purposes.
const OUTSIZED_IMBALANCE: f64 = 0.6;
const ABSORPTION_IMBALANCE: f64 = 0.2;
const EXHAUSTION_DECAY: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct ScoreOutput {
    pub trend: ScorePoint,
    pub exhaustion: ScorePoint,
    pub signal: Option<ReversalSignal>,
}

/// Pure scoring state.
#[derive(Debug)]
pub struct ScorerState {
    weights: ScorerWeights,
    ema_imbalance: f64,
    prev_trend: f64,
    prev_bar_imbalance: f64,
    exhaustion: f64,
    last_tape: Option<TapeAggregate>,
    recent_volumes: VecDeque<f64>,
}

fn bar_totals(bar: &FootprintBar) -> (f64, f64) {
    let mut delta = 0.0;
    let mut volume = 0.0;
    for level in &bar.levels {
        delta += level.delta;
        volume += level.vol_bid + level.vol_ask;
    }
    (delta, volume)
}

impl ScorerState {
    pub fn new(weights: ScorerWeights) -> Self {
        Self {
            weights,
            ema_imbalance: 0.0,
            prev_trend: 0.0,
            prev_bar_imbalance: 0.0,
            exhaustion: 0.0,
            last_tape: None,
            recent_volumes: VecDeque::with_capacity(VOLUME_MEMORY),
        }
    }

    pub fn on_tape(&mut self, tape: TapeAggregate) {
        self.last_tape = Some(tape);
    }

    pub fn on_bar(&mut self, bar: &FootprintBar) -> ScoreOutput {
        let (delta, volume) = bar_totals(bar);
        let imbalance = if volume > 0.0 { delta / volume } else { 0.0 };

        self.ema_imbalance = EMA_ALPHA * imbalance + (1.0 - EMA_ALPHA) * self.ema_imbalance;

        let avg_volume = if self.recent_volumes.is_empty() {
            volume
        } else {
            self.recent_volumes.iter().sum::<f64>() / self.recent_volumes.len() as f64
        };
        self.recent_volumes.push_back(volume);
        while self.recent_volumes.len() > VOLUME_MEMORY {
            self.recent_volumes.pop_front();
        }

        // Absorption: heavy volume with a delta near zero.
        let absorption = if avg_volume > 0.0 && volume >= avg_volume {
            let heaviness = (volume / avg_volume - 1.0).min(1.0);
            let flatness = (1.0 - imbalance.abs() / ABSORPTION_IMBALANCE).max(0.0);
            heaviness * flatness
        } else {
            0.0
        };

        // Exhaustion: an outsized bar answered by an opposing one.
        let opposing = self.prev_bar_imbalance * imbalance < 0.0;
        if opposing && self.prev_bar_imbalance.abs() >= OUTSIZED_IMBALANCE {
            let pulse = (self.prev_bar_imbalance.abs() + imbalance.abs()) / 2.0;
            self.exhaustion = self.exhaustion.max(pulse.min(1.0));
        } else {
            self.exhaustion *= EXHAUSTION_DECAY;
        }

        let tape_imbalance = self
            .last_tape
            .as_ref()
            .map(|t| {
                let total = t.buy_volume + t.sell_volume;
                if total > 0.0 {
                    t.delta / total
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let raw = self.weights.delta * self.ema_imbalance
            + self.weights.tape * tape_imbalance
            - self.weights.absorption * absorption * self.ema_imbalance.signum();
        let trend = raw.clamp(-1.0, 1.0);

        let signal = if self.exhaustion >= self.weights.exhaustion_threshold
            && trend.signum() != self.prev_trend.signum()
            && self.prev_trend.abs() > 0.1
        {
            Some(ReversalSignal {
                ts: bar.end,
                direction: if trend > 0.0 { Side::Buy } else { Side::Sell },
                strength: self.exhaustion,
            })
        } else {
            None
        };

        self.prev_bar_imbalance = imbalance;
        self.prev_trend = trend;

        ScoreOutput {
            trend: ScorePoint {
                ts: bar.end,
                value: trend,
            },
            exhaustion: ScorePoint {
                ts: bar.end,
                value: self.exhaustion,
            },
            signal,
        }
    }
}

pub struct ScorerWorker {
    ctx: WorkerContext,
    state: ScorerState,
    pub stats: Arc<WorkerStats>,
}

impl ScorerWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let state = ScorerState::new(ctx.cfg.scorer.clone());
        Self {
            ctx,
            state,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    async fn emit_output(&self, out: &ScoreOutput) {
        let inst = &self.ctx.instrument;
        let stream = inst.scores_stream();

        if let Ok(payload) = serde_json::to_string(&out.trend) {
            self.ctx
                .emit(
                    &stream,
                    &format!("scores.trend:{}:{}", inst.exchange, inst.symbol),
                    kind::SCORE_TREND,
                    out.trend.ts,
                    &payload,
                    DERIVED_MAXLEN,
                    &self.stats,
                )
                .await;
        }
        if let Ok(payload) = serde_json::to_string(&out.exhaustion) {
            self.ctx
                .emit(
                    &stream,
                    &format!("scores.exhaustion:{}:{}", inst.exchange, inst.symbol),
                    kind::SCORE_EXHAUSTION,
                    out.exhaustion.ts,
                    &payload,
                    DERIVED_MAXLEN,
                    &self.stats,
                )
                .await;
        }
        if let Some(signal) = &out.signal {
            if let Ok(payload) = serde_json::to_string(signal) {
                self.ctx
                    .emit(
                        &stream,
                        &format!("signals.rule_reversal:{}:{}", inst.exchange, inst.symbol),
                        kind::SIGNAL_REVERSAL,
                        signal.ts,
                        &payload,
                        DERIVED_MAXLEN,
                        &self.stats,
                    )
                    .await;
            }
        }
    }

    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.ctx.task_name(WORKER);
        self.ctx.registry.set_state(&name, TaskState::Running);

        let streams = vec![
            self.ctx.instrument.footprint_stream(),
            self.ctx.instrument.tape_stream(),
        ];
        let consumer = self.ctx.consumer_name(WORKER);
        let mut reader = self
            .ctx
            .broker
            .group_reader(WORKER, &consumer, streams)
            .await
            .map_err(|e| anyhow::anyhow!("scorer group setup: {e}"))?;

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
                                kind::FOOTPRINT => {
                                    match serde_json::from_str::<FootprintBar>(&entry.payload) {
                                        Ok(bar) => {
                                            let out = self.state.on_bar(&bar);
                                            self.emit_output(&out).await;
                                        }
                                        Err(e) => {
                                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                            warn!(task = %name, error = %e, "bad footprint record");
                                        }
                                    }
                                }
                                kind::TAPE => {
                                    match serde_json::from_str::<TapeAggregate>(&entry.payload) {
                                        Ok(tape) => self.state.on_tape(tape),
                                        Err(e) => {
                                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                            warn!(task = %name, error = %e, "bad tape record");
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

    fn weights() -> ScorerWeights {
        ScorerWeights {
            delta: 0.5,
            tape: 0.3,
            absorption: 0.2,
            exhaustion_threshold: 0.7,
        }
    }

    fn bar(start: i64, vol_bid: f64, vol_ask: f64) -> FootprintBar {
        FootprintBar {
            start,
            end: start + 60_000,
            levels: vec![crate::models::FootprintLevel {
                price: 100.0,
                vol_bid,
                vol_ask,
                delta: vol_ask - vol_bid,
            }],
            poc_price: Some(100.0),
            imbalance_levels: vec![],
        }
    }

    #[test]
    fn one_sided_buying_pushes_trend_positive() {
        let mut state = ScorerState::new(weights());
        let mut trend = 0.0;
        for i in 0..5 {
            let out = state.on_bar(&bar(T0 + i * 60_000, 1.0, 9.0));
            trend = out.trend.value;
            assert!(out.exhaustion.value < 0.7);
        }
        assert!(trend > 0.1, "trend should be positive, got {trend}");
    }

    #[test]
    fn tape_imbalance_contributes() {
        let mut state = ScorerState::new(weights());
        state.on_tape(TapeAggregate {
            ts: T0,
            buy_volume: 90.0,
            sell_volume: 10.0,
            delta: 80.0,
            trades: 100,
        });
        let with_tape = state.on_bar(&bar(T0, 5.0, 5.0)).trend.value;

        let mut neutral = ScorerState::new(weights());
        let without_tape = neutral.on_bar(&bar(T0, 5.0, 5.0)).trend.value;
        assert!(with_tape > without_tape);
    }

    #[test]
    fn outsized_delta_answered_by_opposing_bar_spikes_exhaustion() {
        let mut state = ScorerState::new(weights());
        state.on_bar(&bar(T0, 1.0, 20.0)); // heavy buying, imbalance ~0.9
        let out = state.on_bar(&bar(T0 + 60_000, 18.0, 2.0)); // answered by selling
        assert!(
            out.exhaustion.value >= 0.7,
            "exhaustion {}",
            out.exhaustion.value
        );
    }

    #[test]
    fn exhaustion_decays_without_reversal() {
        let mut state = ScorerState::new(weights());
        state.on_bar(&bar(T0, 1.0, 20.0));
        let spike = state.on_bar(&bar(T0 + 60_000, 18.0, 2.0)).exhaustion.value;
        let mut last = spike;
        for i in 2..6 {
            last = state
                .on_bar(&bar(T0 + i * 60_000, 5.0, 5.0))
                .exhaustion
                .value;
        }
        assert!(last < spike);
    }

    #[test]
    fn reversal_signal_requires_trend_flip_and_exhaustion() {
        let mut state = ScorerState::new(weights());
        // Build a positive trend.
        for i in 0..4 {
            assert!(state.on_bar(&bar(T0 + i * 60_000, 0.5, 20.0)).signal.is_none());
        }
        // Violent opposing flow: exhaustion spikes and the trend flips.
        let mut saw_signal = None;
        for i in 4..10 {
            let out = state.on_bar(&bar(T0 + i * 60_000, 30.0, 0.5));
            if let Some(sig) = out.signal {
                saw_signal = Some(sig);
                break;
            }
        }
        let sig = saw_signal.expect("reversal signal");
        assert_eq!(sig.direction, Side::Sell);
        assert!(sig.strength >= 0.7);
    }
}
