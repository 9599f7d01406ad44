//! Canonical market-data model shared by every stage of the pipeline.
//!
//! Venue adapters translate wire messages into these types exactly once;
//! everything downstream (ingestors, hot store, analytics, gateway) speaks
//! this vocabulary and nothing venue-specific.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported derivatives venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bybit,
    Binance,
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Bybit => "bybit",
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
        }
    }

    pub const ALL: [Exchange; 3] = [Exchange::Bybit, Exchange::Binance, Exchange::Okx];
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bybit" => Ok(Exchange::Bybit),
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// Aggressor side of a trade, or the book side an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market-data feeds an adapter can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    OrderBook,
    Trades,
    Kline,
    OpenInterest,
    Liquidations,
}

impl Feed {
    pub const ALL: [Feed; 5] = [
        Feed::OrderBook,
        Feed::Trades,
        Feed::Kline,
        Feed::OpenInterest,
        Feed::Liquidations,
    ];
}

/// One (exchange, symbol) pair — the partition key used everywhere.
///
/// `symbol` is always the canonical compact uppercase form (`BTCUSDT`);
/// venue-native spellings never leave the adapter that owns them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub symbol: String,
}

impl Instrument {
    pub fn new(exchange: Exchange, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
        }
    }

    pub fn dom_stream(&self) -> String {
        format!("dom:{}:{}", self.exchange, self.symbol)
    }

    pub fn trades_stream(&self) -> String {
        format!("trades:{}:{}", self.exchange, self.symbol)
    }

    pub fn kline_stream(&self) -> String {
        format!("kline:{}:{}", self.exchange, self.symbol)
    }

    pub fn oi_stream(&self) -> String {
        format!("oi:{}:{}", self.exchange, self.symbol)
    }

    pub fn liq_stream(&self) -> String {
        format!("liq:{}:{}", self.exchange, self.symbol)
    }

    pub fn heatmap_stream(&self) -> String {
        format!("heatmap:{}:{}", self.exchange, self.symbol)
    }

    pub fn footprint_stream(&self) -> String {
        format!("footprint:{}:{}", self.exchange, self.symbol)
    }

    pub fn events_stream(&self) -> String {
        format!("events:{}:{}", self.exchange, self.symbol)
    }

    pub fn tape_stream(&self) -> String {
        format!("tape:{}:{}", self.exchange, self.symbol)
    }

    pub fn scores_stream(&self) -> String {
        format!("scores:{}:{}", self.exchange, self.symbol)
    }

    /// KV key holding the latest DOM snapshot (ttl-bounded).
    pub fn dom_key(&self) -> String {
        format!("dom:{}:{}", self.exchange, self.symbol)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// A price level as it travels on the wire: `[price, size]`.
pub type Level = (f64, f64);

/// A full or incremental book update as the venue delivered it.
///
/// For snapshots `prev_update_id` is `None` and `last_update_id` is the
/// synchronization point. For deltas the venue sequence ids are surfaced
/// untouched — continuity validation is the ingestor's job, not ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    pub ts: i64,
    pub first_update_id: i64,
    pub last_update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_update_id: Option<i64>,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Depth-of-market snapshot published downstream: bids descending, asks
/// ascending, sizes strictly positive, no duplicate prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub ts: i64,
    pub update_id: i64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl DomSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ts: i64,
    pub trade_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub start: i64,
    pub end: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterest {
    pub ts: i64,
    pub open_interest: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub ts: i64,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

/// One row of a heatmap slice: aggregated resting volume per price bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapRow {
    pub bin: f64,
    pub vol_bid: f64,
    pub vol_ask: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapSlice {
    pub ts: i64,
    pub rows: Vec<HeatmapRow>,
}

/// Per-price aggregation inside a footprint bar. `vol_ask` is volume from
/// aggressive buyers (they lift the ask), `vol_bid` from aggressive sellers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintLevel {
    pub price: f64,
    pub vol_bid: f64,
    pub vol_ask: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootprintBar {
    pub start: i64,
    pub end: i64,
    /// Ordered by price ascending.
    pub levels: Vec<FootprintLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poc_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imbalance_levels: Vec<f64>,
}

/// Rolling tape aggregate over the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeAggregate {
    pub ts: i64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub delta: f64,
    pub trades: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "ICEBERG")]
    Iceberg,
    #[serde(rename = "WALL")]
    Wall,
    #[serde(rename = "SPOOF")]
    Spoof,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Iceberg => "ICEBERG",
            EventKind::Wall => "WALL",
            EventKind::Spoof => "SPOOF",
        }
    }
}

/// A detected microstructure event. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub ts: i64,
    pub side: Side,
    pub price: f64,
    pub payload: serde_json::Value,
}

/// Continuous score sample (trend / exhaustion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePoint {
    pub ts: i64,
    pub value: f64,
}

/// Discrete reversal signal from the rule scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalSignal {
    pub ts: i64,
    pub direction: Side,
    pub strength: f64,
}

/// Everything an adapter can hand to its ingestor.
#[derive(Debug, Clone)]
pub enum CanonicalEvent {
    Snapshot(BookUpdate),
    Delta(BookUpdate),
    Trade(Trade),
    Kline(Kline),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
}

/// Record kinds used as the `kind` field on broker stream entries. Each
/// stream carries a closed set; decoders reject anything else.
pub mod kind {
    pub const DOM: &str = "dom";
    pub const TRADE: &str = "trade";
    pub const KLINE: &str = "kline";
    pub const OPEN_INTEREST: &str = "oi";
    pub const LIQUIDATION: &str = "liq";
    pub const HEATMAP: &str = "heatmap";
    pub const FOOTPRINT: &str = "footprint";
    pub const EVENT: &str = "event";
    pub const TAPE: &str = "tape";
    pub const SCORE_TREND: &str = "score.trend";
    pub const SCORE_EXHAUSTION: &str = "score.exhaustion";
    pub const SIGNAL_REVERSAL: &str = "signal.rule_reversal";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_round_trips_through_str() {
        for ex in Exchange::ALL {
            assert_eq!(ex.as_str().parse::<Exchange>().unwrap(), ex);
        }
        assert!("deribit".parse::<Exchange>().is_err());
    }

    #[test]
    fn dom_serializes_levels_as_pairs() {
        let dom = DomSnapshot {
            ts: 1,
            update_id: 10,
            bids: vec![(100.0, 5.0)],
            asks: vec![(101.0, 2.0)],
        };
        let json = serde_json::to_value(&dom).unwrap();
        assert_eq!(json["bids"][0][0], 100.0);
        assert_eq!(json["bids"][0][1], 5.0);
        assert_eq!(json["asks"][0][0], 101.0);
    }

    #[test]
    fn event_kind_uses_upper_case_wire_names() {
        let ev = MarketEvent {
            kind: EventKind::Spoof,
            ts: 5,
            side: Side::Buy,
            price: 99.0,
            payload: serde_json::json!({}),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "SPOOF");
        assert_eq!(json["side"], "buy");
    }

    #[test]
    fn stream_names_follow_the_canonical_layout() {
        let inst = Instrument::new(Exchange::Okx, "BTCUSDT");
        assert_eq!(inst.dom_stream(), "dom:okx:BTCUSDT");
        assert_eq!(inst.trades_stream(), "trades:okx:BTCUSDT");
        assert_eq!(inst.events_stream(), "events:okx:BTCUSDT");
    }
}
