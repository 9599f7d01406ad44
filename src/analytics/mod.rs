//! Derived-stream workers: tape, heatmap, footprint, iceberg, wall/spoof
//! and the trend/exhaustion scorer.
//!
//! Each worker is single-threaded per (exchange, symbol), consumes through
//! a named consumer group (restarts do not reprocess, instances partition),
//! and keeps its detection state in a pure struct that the tests drive
//! directly. Unhandled records are logged, counted, acked and skipped.

pub mod footprint;
pub mod heatmap;
pub mod iceberg;
pub mod scorer;
pub mod tape;
pub mod walls;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::broker::Broker;
use crate::config::Config;
use crate::models::Instrument;
use crate::supervisor::TaskRegistry;

const HEARTBEAT_TTL_SECS: u64 = 10;
pub(crate) const READ_BLOCK_MS: usize = 1_000;
pub(crate) const READ_COUNT: usize = 256;

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub errors: AtomicU64,
    pub emitted: AtomicU64,
}

/// Everything a worker needs, threaded in by the control plane.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Broker,
    pub cfg: Arc<Config>,
    pub instrument: Instrument,
    pub registry: TaskRegistry,
}

impl WorkerContext {
    pub fn task_name(&self, worker: &str) -> String {
        format!("{worker}:{}", self.instrument)
    }

    /// Consumer identity within the group: stable per process so redelivery
    /// after a crash lands on the successor instance.
    pub fn consumer_name(&self, worker: &str) -> String {
        format!("{worker}-{}-{}", self.instrument, std::process::id())
    }

    /// Registry + KV liveness heartbeat (`worker:{name}:hb`).
    pub async fn heartbeat(&self, worker: &str) {
        let name = self.task_name(worker);
        self.registry.heartbeat(&name);
        let now = chrono::Utc::now().timestamp_millis();
        let _ = self
            .broker
            .kv_set(&format!("worker:{name}:hb"), &now.to_string(), HEARTBEAT_TTL_SECS)
            .await;
    }

    /// Append a derived record and publish it for the gateway. Emission is
    /// best-effort: transport failures are counted and the worker moves on.
    pub async fn emit(
        &self,
        stream: &str,
        channel: &str,
        record_kind: &str,
        ts: i64,
        payload: &str,
        maxlen: usize,
        stats: &WorkerStats,
    ) {
        match self
            .broker
            .stream_append(stream, record_kind, ts, payload, maxlen)
            .await
        {
            Ok(_) => {
                stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(stream, error = %e, "derived stream append failed");
            }
        }
        if let Err(e) = self.broker.publish(channel, payload).await {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(channel, error = %e, "derived publish failed");
        }
    }
}

/// Default maxlen for derived streams that are not separately configured.
pub(crate) const DERIVED_MAXLEN: usize = 2_000;
