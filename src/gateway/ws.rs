//! Per-client WebSocket handling: channel parsing, snapshot-then-stream
//! delivery, bounded send queue with DOM-preserving drop policy, ping/pong
//! liveness.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::models::{DomSnapshot, Exchange, Instrument};

use super::GatewayState;

/// Unknown channel in the subscription.
const CLOSE_BAD_SUBSCRIPTION: u16 = 4400;
/// Two consecutive missed pongs.
const CLOSE_UNRESPONSIVE: u16 = 1011;

const SEND_QUEUE_CAPACITY: usize = 1_024;
const SEND_QUEUE_LOW_WATER: usize = 768;
const PING_PERIOD: Duration = Duration::from_secs(20);
const MAX_MISSED_PONGS: u32 = 2;

/// Client-subscribable channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    OrderbookRealtime,
    TradesRealtime,
    Kline,
    OpenInterest,
    Liquidations,
    HeatmapStream,
    FootprintStream,
    EventsStream,
    ScoresTrend,
    ScoresExhaustion,
    SignalsRuleReversal,
    AiResponse,
}

impl Channel {
    pub fn parse(name: &str) -> Option<Channel> {
        match name {
            "orderbook_realtime" => Some(Channel::OrderbookRealtime),
            "trades_realtime" => Some(Channel::TradesRealtime),
            "kline" => Some(Channel::Kline),
            "open_interest" => Some(Channel::OpenInterest),
            "liquidations" => Some(Channel::Liquidations),
            "heatmap_stream" => Some(Channel::HeatmapStream),
            "footprint_stream" => Some(Channel::FootprintStream),
            "events_stream" => Some(Channel::EventsStream),
            "scores.trend" => Some(Channel::ScoresTrend),
            "scores.exhaustion" => Some(Channel::ScoresExhaustion),
            "signals.rule_reversal" => Some(Channel::SignalsRuleReversal),
            "ai_response" => Some(Channel::AiResponse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::OrderbookRealtime => "orderbook_realtime",
            Channel::TradesRealtime => "trades_realtime",
            Channel::Kline => "kline",
            Channel::OpenInterest => "open_interest",
            Channel::Liquidations => "liquidations",
            Channel::HeatmapStream => "heatmap_stream",
            Channel::FootprintStream => "footprint_stream",
            Channel::EventsStream => "events_stream",
            Channel::ScoresTrend => "scores.trend",
            Channel::ScoresExhaustion => "scores.exhaustion",
            Channel::SignalsRuleReversal => "signals.rule_reversal",
            Channel::AiResponse => "ai_response",
        }
    }

    /// The broker pub/sub channel backing this client channel.
    pub fn pubsub_channel(&self, inst: &Instrument) -> String {
        let (ex, sym) = (inst.exchange, &inst.symbol);
        match self {
            Channel::OrderbookRealtime => format!("dom:{ex}:{sym}"),
            Channel::TradesRealtime => format!("trades:{ex}:{sym}"),
            Channel::Kline => format!("kline:{ex}:{sym}"),
            Channel::OpenInterest => format!("oi:{ex}:{sym}"),
            Channel::Liquidations => format!("liq:{ex}:{sym}"),
            Channel::HeatmapStream => format!("heatmap:{ex}:{sym}"),
            Channel::FootprintStream => format!("footprint:{ex}:{sym}"),
            Channel::EventsStream => format!("events:{ex}:{sym}"),
            Channel::ScoresTrend => format!("scores.trend:{ex}:{sym}"),
            Channel::ScoresExhaustion => format!("scores.exhaustion:{ex}:{sym}"),
            Channel::SignalsRuleReversal => format!("signals.rule_reversal:{ex}:{sym}"),
            Channel::AiResponse => format!("ai_response:{ex}:{sym}"),
        }
    }
}

/// Parse a comma-separated channel list; any unknown name fails the whole
/// subscription.
pub fn parse_channels(raw: &str) -> Result<Vec<Channel>, String> {
    let mut out = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match Channel::parse(name) {
            Some(c) => {
                if !out.contains(&c) {
                    out.push(c);
                }
            }
            None => return Err(name.to_string()),
        }
    }
    if out.is_empty() {
        return Err("empty channel list".to_string());
    }
    Ok(out)
}

#[derive(Debug, Clone)]
enum Frame {
    /// Latest DOM envelope; superseded by a newer one while queued.
    Dom(String),
    Other(String),
}

impl Frame {
    fn into_text(self) -> String {
        match self {
            Frame::Dom(s) | Frame::Other(s) => s,
        }
    }
}

/// Bounded per-client send queue. Overflow drops the oldest non-DOM frames
/// down to the low-water mark; the queued DOM is only ever replaced by a
/// newer one. Frames are never reordered.
pub struct SendQueue {
    frames: Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
    low_water: usize,
    pub dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize, low_water: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            low_water,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push_dom(&self, text: String) {
        let mut frames = self.frames.lock();
        // Newest DOM supersedes an older queued one, keeping its slot so
        // ordering relative to other frames is preserved.
        if let Some(slot) = frames.iter_mut().find(|f| matches!(f, Frame::Dom(_))) {
            *slot = Frame::Dom(text);
        } else {
            frames.push_back(Frame::Dom(text));
        }
        self.shed(&mut frames);
        drop(frames);
        self.notify.notify_one();
    }

    pub fn push(&self, text: String) {
        let mut frames = self.frames.lock();
        frames.push_back(Frame::Other(text));
        self.shed(&mut frames);
        drop(frames);
        self.notify.notify_one();
    }

    fn shed(&self, frames: &mut VecDeque<Frame>) {
        if frames.len() <= self.capacity {
            return;
        }
        let mut idx = 0;
        while frames.len() > self.low_water && idx < frames.len() {
            if matches!(frames[idx], Frame::Dom(_)) {
                idx += 1; // never shed the DOM
            } else {
                frames.remove(idx);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn pop(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.frames.lock().pop_front() {
                return frame.into_text();
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub exchange: String,
    pub symbol: String,
    pub channels: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, params: WsParams, state: GatewayState) {
    let Ok(exchange) = params.exchange.parse::<Exchange>() else {
        close_with(socket, CLOSE_BAD_SUBSCRIPTION, "unknown exchange").await;
        return;
    };
    let channels = match parse_channels(&params.channels) {
        Ok(c) => c,
        Err(bad) => {
            debug!(channel = %bad, "rejecting subscription");
            close_with(socket, CLOSE_BAD_SUBSCRIPTION, "unknown channel").await;
            return;
        }
    };
    let inst = Instrument::new(exchange, params.symbol.to_uppercase());

    // Subscribe before reading the snapshot so no update is lost on the
    // seam; duplicates are filtered by update id below.
    let mut by_pubsub: HashMap<String, Channel> = HashMap::new();
    for ch in &channels {
        by_pubsub.insert(ch.pubsub_channel(&inst), *ch);
    }
    let pubsub_names: Vec<String> = by_pubsub.keys().cloned().collect();
    let mut feed = match state.broker.subscribe(pubsub_names).await {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "pubsub subscribe failed");
            close_with(socket, CLOSE_UNRESPONSIVE, "broker unavailable").await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // First frame: the latest known DOM.
    let mut snapshot_update_id: i64 = i64::MIN;
    let wants_book = channels.contains(&Channel::OrderbookRealtime);
    if wants_book {
        let dom = match state.doms.get(inst.exchange, &inst.symbol) {
            Some(dom) => Some(dom),
            None => match state.broker.kv_get(&inst.dom_key()).await {
                Ok(Some(raw)) => serde_json::from_str::<DomSnapshot>(&raw).ok(),
                _ => None,
            },
        };
        if let Some(dom) = dom {
            snapshot_update_id = dom.update_id;
            let first = serde_json::json!({"type": "dom", "data": dom});
            if sender.send(Message::Text(first.to_string())).await.is_err() {
                return;
            }
        }
    }

    info!(instrument = %inst, channels = channels.len(), "client subscribed");

    let queue = Arc::new(SendQueue::new(SEND_QUEUE_CAPACITY, SEND_QUEUE_LOW_WATER));
    let unanswered_pings = Arc::new(AtomicU32::new(0));

    // Writer task: queue -> socket, plus ping cadence. Separate from the
    // fanout loop so a slow client backs up into the shedding queue, never
    // into the broker subscription.
    let mut writer = tokio::spawn({
        let queue = queue.clone();
        let unanswered_pings = unanswered_pings.clone();
        async move {
            let mut ping = tokio::time::interval(PING_PERIOD);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ping.tick().await; // consume the immediate tick
            loop {
                tokio::select! {
                    text = queue.pop() => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    _ = ping.tick() => {
                        if unanswered_pings.load(Ordering::Relaxed) >= MAX_MISSED_PONGS {
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: CLOSE_UNRESPONSIVE,
                                    reason: "pong timeout".into(),
                                })))
                                .await;
                            return;
                        }
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            return;
                        }
                        unanswered_pings.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            // Writer gone: unresponsive client or socket error.
            _ = &mut writer => break,
            // Broker fanout -> bounded queue.
            msg = feed.next() => {
                let Some((pubsub_channel, payload)) = msg else {
                    debug!(instrument = %inst, "pubsub stream ended");
                    break;
                };
                let Some(channel) = by_pubsub.get(&pubsub_channel) else {
                    continue;
                };
                let data: serde_json::Value = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(_) => continue, // producer bug; do not corrupt the client
                };
                let envelope = serde_json::json!({"stream": channel.as_str(), "data": data});
                if *channel == Channel::OrderbookRealtime {
                    // Seam dedup: anything at or before the snapshot is old.
                    let update_id = envelope["data"]
                        .get("update_id")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(i64::MAX);
                    if update_id <= snapshot_update_id {
                        continue;
                    }
                    queue.push_dom(envelope.to_string());
                } else {
                    queue.push(envelope.to_string());
                }
            }
            // Client frames.
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        unanswered_pings.store(0, Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // client text/binary is ignored
                    Some(Err(e)) => {
                        debug!(instrument = %inst, error = %e, "client socket error");
                        break;
                    }
                }
            }
        }
    }
    writer.abort();

    let dropped = queue.dropped.load(Ordering::Relaxed);
    if dropped > 0 {
        info!(instrument = %inst, dropped, "client disconnected with shed frames");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        for name in [
            "orderbook_realtime",
            "trades_realtime",
            "kline",
            "open_interest",
            "liquidations",
            "heatmap_stream",
            "footprint_stream",
            "events_stream",
            "scores.trend",
            "scores.exhaustion",
            "signals.rule_reversal",
            "ai_response",
        ] {
            let ch = Channel::parse(name).unwrap_or_else(|| panic!("{name} should parse"));
            assert_eq!(ch.as_str(), name);
        }
        assert!(Channel::parse("orderbook").is_none());
    }

    #[test]
    fn unknown_channel_fails_the_whole_subscription() {
        assert!(parse_channels("orderbook_realtime,trades_realtime").is_ok());
        assert_eq!(
            parse_channels("orderbook_realtime,nope").unwrap_err(),
            "nope"
        );
        assert!(parse_channels("").is_err());
    }

    #[test]
    fn pubsub_channels_mirror_stream_names() {
        let inst = Instrument::new(Exchange::Bybit, "BTCUSDT");
        assert_eq!(
            Channel::OrderbookRealtime.pubsub_channel(&inst),
            "dom:bybit:BTCUSDT"
        );
        assert_eq!(
            Channel::ScoresTrend.pubsub_channel(&inst),
            "scores.trend:bybit:BTCUSDT"
        );
        assert_eq!(
            Channel::AiResponse.pubsub_channel(&inst),
            "ai_response:bybit:BTCUSDT"
        );
    }

    #[tokio::test]
    async fn queue_sheds_oldest_non_dom_to_low_water() {
        let queue = SendQueue::new(8, 4);
        queue.push_dom("dom-1".to_string());
        for i in 0..10 {
            queue.push(format!("t{i}"));
        }
        // Crossing capacity (at t7) sheds oldest non-DOM down to low water:
        // t0..t4 go, the DOM and the newest frames stay.
        assert_eq!(queue.len(), 6);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 5);

        // dom survives at the front
        assert_eq!(queue.pop().await, "dom-1");
    }

    #[tokio::test]
    async fn newest_dom_supersedes_queued_dom_in_place() {
        let queue = SendQueue::new(8, 4);
        queue.push("a".to_string());
        queue.push_dom("dom-old".to_string());
        queue.push("b".to_string());
        queue.push_dom("dom-new".to_string());

        assert_eq!(queue.len(), 3); // a, dom-new, b
        assert_eq!(queue.pop().await, "a");
        assert_eq!(queue.pop().await, "dom-new");
        assert_eq!(queue.pop().await, "b");
    }

    #[test]
    fn queue_is_bounded_under_sustained_pressure() {
        let queue = SendQueue::new(8, 4);
        for i in 0..10_000 {
            queue.push(format!("t{i}"));
        }
        assert!(queue.len() <= 8);
        assert!(queue.dropped.load(Ordering::Relaxed) >= 10_000 - 8);
    }
}
