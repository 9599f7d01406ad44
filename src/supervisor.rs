//! Control plane: task registry and supervised spawning.
//!
//! Every long-running task (ingestor, worker, hot store) registers here.
//! On exit it is restarted with jittered exponential backoff; the registry
//! backs `GET /health`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A task that survived this long gets its backoff reset.
const STABLE_RUN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Starting,
    Running,
    Unstable,
    Failed,
    Stopped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Unstable => "unstable",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
struct TaskInfo {
    state: TaskState,
    last_heartbeat: Instant,
    restarts: u32,
}

/// Health row as served by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHealth {
    pub name: String,
    pub state: &'static str,
    pub last_hb_ms_ago: u64,
    pub restarts: u32,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<String, TaskInfo>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, name: &str, state: TaskState) {
        let mut inner = self.inner.write();
        let entry = inner.entry(name.to_string()).or_insert_with(|| TaskInfo {
            state,
            last_heartbeat: Instant::now(),
            restarts: 0,
        });
        entry.state = state;
        entry.last_heartbeat = Instant::now();
    }

    pub fn heartbeat(&self, name: &str) {
        if let Some(entry) = self.inner.write().get_mut(name) {
            entry.last_heartbeat = Instant::now();
        }
    }

    fn record_restart(&self, name: &str) {
        if let Some(entry) = self.inner.write().get_mut(name) {
            entry.restarts += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<TaskHealth> {
        let now = Instant::now();
        let mut rows: Vec<TaskHealth> = self
            .inner
            .read()
            .iter()
            .map(|(name, info)| TaskHealth {
                name: name.clone(),
                state: info.state.as_str(),
                last_hb_ms_ago: now.duration_since(info.last_heartbeat).as_millis() as u64,
                restarts: info.restarts,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// True when no task is failed and every heartbeat is recent.
    pub fn all_healthy(&self, max_hb_age: Duration) -> bool {
        let now = Instant::now();
        self.inner.read().values().all(|info| {
            info.state != TaskState::Failed
                && now.duration_since(info.last_heartbeat) <= max_hb_age
        })
    }
}

/// Next restart delay: exponential in the consecutive-failure count with
/// full jitter, capped.
pub fn restart_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.min(5);
    let ceiling = RESTART_BACKOFF_BASE * 2u32.saturating_pow(exp);
    let ceiling = ceiling.min(RESTART_BACKOFF_CAP);
    let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Spawn a task that is restarted on exit until cancelled. `factory` builds
/// a fresh future per attempt.
pub fn spawn_supervised<F, Fut>(
    name: String,
    registry: TaskRegistry,
    mut cancel: watch::Receiver<bool>,
    mut factory: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    registry.set_state(&name, TaskState::Starting);
    tokio::spawn(async move {
        let mut consecutive_failures: u32 = 0;
        loop {
            if *cancel.borrow() {
                registry.set_state(&name, TaskState::Stopped);
                return;
            }

            let started = Instant::now();
            let result = tokio::select! {
                r = factory() => Some(r),
                _ = wait_cancelled(&mut cancel) => None,
            };

            match result {
                None => {
                    registry.set_state(&name, TaskState::Stopped);
                    return;
                }
                Some(Ok(())) => {
                    if *cancel.borrow() {
                        registry.set_state(&name, TaskState::Stopped);
                        return;
                    }
                    info!(task = %name, "task exited cleanly, restarting");
                    consecutive_failures = 0;
                }
                Some(Err(e)) => {
                    warn!(task = %name, error = %e, "task failed");
                    registry.set_state(&name, TaskState::Failed);
                    if started.elapsed() >= STABLE_RUN {
                        consecutive_failures = 1;
                    } else {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                    }
                }
            }

            registry.record_restart(&name);
            let delay = restart_delay(consecutive_failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_cancelled(&mut cancel) => {
                    registry.set_state(&name, TaskState::Stopped);
                    return;
                }
            }
            registry.set_state(&name, TaskState::Starting);
        }
    });
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_is_bounded_by_the_cap() {
        for failures in 0..20 {
            let d = restart_delay(failures);
            assert!(d <= RESTART_BACKOFF_CAP);
        }
    }

    #[test]
    fn registry_tracks_state_and_restarts() {
        let registry = TaskRegistry::new();
        registry.set_state("ingestor:bybit:BTCUSDT", TaskState::Running);
        registry.record_restart("ingestor:bybit:BTCUSDT");
        registry.record_restart("ingestor:bybit:BTCUSDT");

        let rows = registry.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "running");
        assert_eq!(rows[0].restarts, 2);
        assert!(registry.all_healthy(Duration::from_secs(10)));

        registry.set_state("ingestor:bybit:BTCUSDT", TaskState::Failed);
        assert!(!registry.all_healthy(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn supervised_task_stops_on_cancel() {
        let registry = TaskRegistry::new();
        let (tx, rx) = watch::channel(false);
        spawn_supervised("t".to_string(), registry.clone(), rx, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows = registry.snapshot();
        assert_eq!(rows[0].state, "stopped");
    }
}
