//! Hot state store: consumes the raw streams through a consumer group,
//! keeps the authoritative in-process DOM table, and fans records out to
//! KV (ttl-bounded) and pub/sub for the gateway.
//!
//! The ingestor already validated ordering, so this store trusts stream
//! order. It is the single writer of the `dom:{ex}:{sym}` KV keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::{Broker, StreamEntry};
use crate::config::Config;
use crate::models::{kind, DomSnapshot, Exchange, Instrument};
use crate::supervisor::{TaskRegistry, TaskState};

const GROUP: &str = "hotstore";
const DOM_TTL_SECS: u64 = 60;
const HEARTBEAT_TTL_SECS: u64 = 10;
const READ_BLOCK_MS: usize = 1_000;
const READ_COUNT: usize = 256;

/// Read-only view of the latest DOM per instrument, shared with the
/// gateway for its on-connect bootstrap and `GET /dom`.
#[derive(Clone, Default)]
pub struct DomTable {
    inner: Arc<RwLock<HashMap<Instrument, DomSnapshot>>>,
}

impl DomTable {
    pub fn get(&self, exchange: Exchange, symbol: &str) -> Option<DomSnapshot> {
        self.inner
            .read()
            .get(&Instrument::new(exchange, symbol))
            .cloned()
    }

    fn insert(&self, instrument: Instrument, dom: DomSnapshot) {
        self.inner.write().insert(instrument, dom);
    }
}

#[derive(Debug, Default)]
pub struct HotStoreStats {
    pub records: AtomicU64,
    pub unknown_kinds: AtomicU64,
    pub publish_errors: AtomicU64,
}

pub struct HotStore {
    broker: Broker,
    cfg: Arc<Config>,
    registry: TaskRegistry,
    table: DomTable,
    pub stats: Arc<HotStoreStats>,
}

impl HotStore {
    /// `table` is shared with the gateway; restarts of the store task reuse
    /// it so `GET /dom` keeps serving the last-known books.
    pub fn new(broker: Broker, cfg: Arc<Config>, registry: TaskRegistry, table: DomTable) -> Self {
        Self {
            broker,
            cfg,
            registry,
            table,
            stats: Arc::new(HotStoreStats::default()),
        }
    }

    fn raw_streams(&self) -> Vec<String> {
        let mut streams = Vec::new();
        for inst in self.cfg.instruments() {
            streams.push(inst.dom_stream());
            streams.push(inst.trades_stream());
            streams.push(inst.kline_stream());
            streams.push(inst.oi_stream());
            streams.push(inst.liq_stream());
        }
        streams
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        const NAME: &str = "hotstore";
        self.registry.set_state(NAME, TaskState::Running);

        let consumer = format!("hotstore-{}", std::process::id());
        let streams = self.raw_streams();
        if streams.is_empty() {
            info!("no instruments configured, hot store idle");
            loop {
                if *cancel.borrow() {
                    self.registry.set_state(NAME, TaskState::Stopped);
                    return Ok(());
                }
                if cancel.changed().await.is_err() {
                    return Ok(());
                }
            }
        }
        let mut reader = self
            .broker
            .group_reader(GROUP, &consumer, streams)
            .await
            .map_err(|e| anyhow::anyhow!("hot store group setup: {e}"))?;

        loop {
            if *cancel.borrow() {
                self.registry.set_state(NAME, TaskState::Stopped);
                return Ok(());
            }

            let batches = tokio::select! {
                r = reader.read(READ_BLOCK_MS, READ_COUNT) => r,
                _ = cancel.changed() => continue,
            };

            self.registry.heartbeat(NAME);
            let now = chrono::Utc::now().timestamp_millis();
            let _ = self
                .broker
                .kv_set("worker:hotstore:hb", &now.to_string(), HEARTBEAT_TTL_SECS)
                .await;

            let batches = match batches {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "hot store read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for batch in batches {
                let mut ids = Vec::with_capacity(batch.entries.len());
                for entry in &batch.entries {
                    self.handle_record(&batch.stream, entry).await;
                    ids.push(entry.id.clone());
                }
                if let Err(e) = reader.ack(&batch.stream, &ids).await {
                    warn!(stream = %batch.stream, error = %e, "ack failed");
                }
            }
        }
    }

    async fn handle_record(&self, stream: &str, entry: &StreamEntry) {
        self.stats.records.fetch_add(1, Ordering::Relaxed);

        match entry.kind.as_str() {
            kind::DOM => {
                let Some(instrument) = instrument_from_stream(stream) else {
                    warn!(stream, "unparseable dom stream name");
                    return;
                };
                let dom: DomSnapshot = match serde_json::from_str(&entry.payload) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(stream, error = %e, "bad dom payload, skipping");
                        self.stats.unknown_kinds.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                };
                self.table.insert(instrument.clone(), dom);
                if let Err(e) = self
                    .broker
                    .kv_set(&instrument.dom_key(), &entry.payload, DOM_TTL_SECS)
                    .await
                {
                    self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(stream, error = %e, "dom kv write failed");
                }
                self.publish(stream, &entry.payload).await;
            }
            kind::TRADE | kind::KLINE | kind::OPEN_INTEREST | kind::LIQUIDATION => {
                // Mirror channels share the stream name.
                self.publish(stream, &entry.payload).await;
            }
            other => {
                // Unknown record kinds are acked and dropped: a newer writer
                // talking to an older store must not wedge the group.
                self.stats.unknown_kinds.fetch_add(1, Ordering::Relaxed);
                warn!(stream, kind = other, "unknown record kind");
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) {
        if let Err(e) = self.broker.publish(channel, payload).await {
            self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
            warn!(channel, error = %e, "pubsub publish failed");
        }
    }
}

fn instrument_from_stream(stream: &str) -> Option<Instrument> {
    let mut parts = stream.splitn(3, ':');
    let _prefix = parts.next()?;
    let exchange: Exchange = parts.next()?.parse().ok()?;
    let symbol = parts.next()?;
    Some(Instrument::new(exchange, symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_parse_back_to_instruments() {
        let inst = instrument_from_stream("dom:bybit:BTCUSDT").unwrap();
        assert_eq!(inst.exchange, Exchange::Bybit);
        assert_eq!(inst.symbol, "BTCUSDT");
        assert!(instrument_from_stream("dom:unknown:BTCUSDT").is_none());
        assert!(instrument_from_stream("dom").is_none());
    }

    #[test]
    fn dom_table_is_keyed_by_instrument() {
        let table = DomTable::default();
        let dom = DomSnapshot {
            ts: 1,
            update_id: 2,
            bids: vec![(100.0, 1.0)],
            asks: vec![(101.0, 1.0)],
        };
        table.insert(Instrument::new(Exchange::Okx, "BTCUSDT"), dom);
        assert!(table.get(Exchange::Okx, "BTCUSDT").is_some());
        assert!(table.get(Exchange::Bybit, "BTCUSDT").is_none());
    }
}
