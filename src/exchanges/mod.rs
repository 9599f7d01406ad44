//! Venue adapters and the shared WebSocket feed loop.
//!
//! An adapter owns everything venue-specific: URLs, subscription framing,
//! heartbeat conventions, symbol spelling and wire→canonical translation.
//! The feed loop owns everything generic: connect/reconnect with full-jitter
//! backoff, idle deadlines, ping cadence and malformed-frame accounting.

pub mod binance;
pub mod bybit;
pub mod okx;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::models::{BookUpdate, CanonicalEvent, Exchange, Feed, OpenInterest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Malformed frames tolerated on one connection before it is torn down.
const PARSE_ERROR_LIMIT: u64 = 50;

#[async_trait]
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;
    /// Canonical symbol (`BTCUSDT`).
    fn symbol(&self) -> &str;
    /// True when the book topic pushes a full WS snapshot on (re)subscribe
    /// (Bybit, OKX). The ingestor treats that as a fast-path sync point on
    /// top of the REST snapshot-and-reconcile algorithm and nudges a
    /// redial on resync so one is resent.
    fn pushes_snapshots(&self) -> bool {
        false
    }
    fn ws_url(&self) -> String;
    /// Subscription frames to send after connect, one JSON text each.
    fn subscribe_frames(&self, feeds: &[Feed]) -> Vec<String>;
    /// Venue application-level ping frame; `None` means protocol pings only.
    fn ping_frame(&self) -> Option<String>;
    fn ping_interval(&self) -> Duration {
        Duration::from_secs(20)
    }
    /// Translate one wire message. Non-data frames (acks, pongs) yield an
    /// empty vec; malformed frames are a `Protocol` error.
    fn parse_message(&self, raw: &str) -> FeedResult<Vec<CanonicalEvent>>;
    /// REST book snapshot at the venue-recommended depth.
    async fn fetch_snapshot(&self, depth: usize) -> FeedResult<BookUpdate>;
    /// REST open-interest polling cadence, for venues without an OI stream.
    fn oi_poll_interval(&self) -> Option<Duration> {
        None
    }
    async fn fetch_open_interest(&self) -> FeedResult<Option<OpenInterest>> {
        Ok(None)
    }
}

/// Per-feed counters, aggregate-only (exposed through `/health`).
#[derive(Debug, Default)]
pub struct FeedStats {
    pub messages_received: AtomicU64,
    pub events_emitted: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Handle to a running venue feed.
pub struct FeedHandle {
    pub events: mpsc::Receiver<CanonicalEvent>,
    /// Ingestor-side request to drop and redial the socket so a
    /// snapshot-pushing venue resends its book snapshot. Best-effort;
    /// coalesced if one is already pending.
    pub resync: mpsc::Sender<()>,
    pub stats: Arc<FeedStats>,
}

/// Spawn the connection task for one (venue, symbol) and hand back the
/// canonical event stream.
pub fn spawn_feed(
    adapter: Arc<dyn ExchangeAdapter>,
    feeds: Vec<Feed>,
    cancel: watch::Receiver<bool>,
) -> FeedHandle {
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (resync_tx, resync_rx) = mpsc::channel(1);
    let stats = Arc::new(FeedStats::default());

    if let Some(period) = adapter.oi_poll_interval() {
        if feeds.contains(&Feed::OpenInterest) {
            tokio::spawn(poll_open_interest(
                adapter.clone(),
                period,
                event_tx.clone(),
                cancel.clone(),
            ));
        }
    }

    let worker_stats = stats.clone();
    tokio::spawn(async move {
        run_feed(adapter, feeds, event_tx, resync_rx, cancel, worker_stats).await;
    });

    FeedHandle {
        events: event_rx,
        resync: resync_tx,
        stats,
    }
}

async fn run_feed(
    adapter: Arc<dyn ExchangeAdapter>,
    feeds: Vec<Feed>,
    event_tx: mpsc::Sender<CanonicalEvent>,
    mut resync_rx: mpsc::Receiver<()>,
    mut cancel: watch::Receiver<bool>,
    stats: Arc<FeedStats>,
) {
    let mut backoff = BACKOFF_BASE;

    loop {
        if *cancel.borrow() {
            return;
        }

        match connect_and_stream(
            adapter.as_ref(),
            &feeds,
            &event_tx,
            &mut resync_rx,
            &mut cancel,
            &stats,
        )
        .await
        {
            Ok(()) => return, // cancelled or consumer gone
            Err(FeedError::Disconnect(reason)) if reason == "resync" => {
                // Deliberate redial; skip the backoff so the fresh venue
                // snapshot arrives quickly.
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                backoff = BACKOFF_BASE;
                continue;
            }
            Err(e) => {
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
                warn!(
                    exchange = %adapter.exchange(),
                    symbol = adapter.symbol(),
                    error = %e,
                    backoff_ms = jitter_ms,
                    "feed disconnected, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
                    _ = cancel.changed() => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

async fn connect_and_stream(
    adapter: &dyn ExchangeAdapter,
    feeds: &[Feed],
    event_tx: &mpsc::Sender<CanonicalEvent>,
    resync_rx: &mut mpsc::Receiver<()>,
    cancel: &mut watch::Receiver<bool>,
    stats: &FeedStats,
) -> FeedResult<()> {
    let url = adapter.ws_url();
    debug!(exchange = %adapter.exchange(), symbol = adapter.symbol(), url = %url, "connecting");

    let (ws_stream, _resp) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
        .await
        .map_err(|_| FeedError::Disconnect("connect timeout".to_string()))??;

    let (mut write, mut read) = ws_stream.split();

    for frame in adapter.subscribe_frames(feeds) {
        write.send(Message::Text(frame)).await?;
    }
    info!(
        exchange = %adapter.exchange(),
        symbol = adapter.symbol(),
        feeds = feeds.len(),
        "subscribed"
    );

    let mut ping = tokio::time::interval(adapter.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut parse_errors_this_conn: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            Some(_) = resync_rx.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Err(FeedError::Disconnect("resync".to_string()));
            }
            _ = ping.tick() => {
                match adapter.ping_frame() {
                    Some(frame) => { let _ = write.send(Message::Text(frame)).await; }
                    None => { let _ = write.send(Message::Ping(Vec::new())).await; }
                }
            }
            msg = tokio::time::timeout(IDLE_READ_TIMEOUT, read.next()) => {
                let msg = msg.map_err(|_| FeedError::Disconnect("idle read timeout".to_string()))?;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        match adapter.parse_message(&text) {
                            Ok(events) => {
                                for ev in events {
                                    stats.events_emitted.fetch_add(1, Ordering::Relaxed);
                                    if event_tx.send(ev).await.is_err() {
                                        return Ok(()); // ingestor gone
                                    }
                                }
                            }
                            Err(FeedError::Protocol(reason)) => {
                                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                                parse_errors_this_conn += 1;
                                debug!(
                                    exchange = %adapter.exchange(),
                                    symbol = adapter.symbol(),
                                    reason,
                                    "dropping malformed frame"
                                );
                                if parse_errors_this_conn >= PARSE_ERROR_LIMIT {
                                    return Err(FeedError::Protocol(
                                        "malformed-frame rate exceeded, reconnecting".to_string(),
                                    ));
                                }
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(FeedError::Disconnect(format!("server close: {frame:?}")));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(FeedError::Disconnect("stream ended".to_string())),
                }
            }
        }
    }
}

/// REST open-interest poller for venues without an OI stream.
async fn poll_open_interest(
    adapter: Arc<dyn ExchangeAdapter>,
    period: Duration,
    event_tx: mpsc::Sender<CanonicalEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                match adapter.fetch_open_interest().await {
                    Ok(Some(oi)) => {
                        if event_tx.send(CanonicalEvent::OpenInterest(oi)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(
                            exchange = %adapter.exchange(),
                            symbol = adapter.symbol(),
                            error = %e,
                            "open interest poll failed"
                        );
                    }
                }
            }
        }
    }
}

/// Shared helper: parse a decimal string from venue JSON.
pub(crate) fn parse_f64(raw: &str, what: &str) -> FeedResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| FeedError::Protocol(format!("bad {what}: {raw:?}")))
}

/// Shared helper: `[["price","size"], ...]` into canonical levels.
pub(crate) fn parse_levels(raw: &[Vec<String>]) -> FeedResult<Vec<(f64, f64)>> {
    let mut out = Vec::with_capacity(raw.len());
    for lvl in raw {
        if lvl.len() < 2 {
            return Err(FeedError::Protocol(format!("short level: {lvl:?}")));
        }
        out.push((parse_f64(&lvl[0], "price")?, parse_f64(&lvl[1], "size")?));
    }
    Ok(out)
}

/// Adapter factory for the supervisor.
pub fn make_adapter(
    exchange: Exchange,
    symbol: &str,
    http: reqwest::Client,
) -> Arc<dyn ExchangeAdapter> {
    match exchange {
        Exchange::Bybit => Arc::new(bybit::BybitAdapter::new(symbol, http)),
        Exchange::Binance => Arc::new(binance::BinanceAdapter::new(symbol, http)),
        Exchange::Okx => Arc::new(okx::OkxAdapter::new(symbol, http)),
    }
}
