//! Bybit v5 linear-perpetual adapter.
//!
//! The orderbook topic pushes a full snapshot on subscribe and +1-sequenced
//! deltas afterwards; the REST orderbook endpoint shares the same update-id
//! domain, so both sync paths reconcile the same way. Open interest rides
//! on the tickers topic.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{FeedError, FeedResult};
use crate::models::{
    BookUpdate, CanonicalEvent, Exchange, Feed, Kline, Liquidation, OpenInterest, Side, Trade,
};

use super::{parse_f64, parse_levels, ExchangeAdapter};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const REST_BASE: &str = "https://api.bybit.com";
const BOOK_DEPTH: usize = 200;

pub struct BybitAdapter {
    symbol: String,
    http: reqwest::Client,
}

impl BybitAdapter {
    pub fn new(symbol: &str, http: reqwest::Client) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    topic: Option<String>,
    #[serde(rename = "type", default)]
    msg_type: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireBook {
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
    #[serde(rename = "u")]
    update_id: i64,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    #[serde(rename = "T")]
    ts: i64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "i")]
    trade_id: String,
}

#[derive(Debug, Deserialize)]
struct WireKline {
    start: i64,
    end: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    #[serde(rename = "openInterest", default)]
    open_interest: Option<String>,
    #[serde(rename = "openInterestValue", default)]
    open_interest_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireLiquidation {
    #[serde(rename = "updatedTime")]
    ts: i64,
    side: String,
    size: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct RestBookEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    result: RestBook,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
    ts: i64,
    #[serde(rename = "u")]
    update_id: i64,
}

fn wire_side(raw: &str) -> FeedResult<Side> {
    match raw {
        "Buy" | "buy" => Ok(Side::Buy),
        "Sell" | "sell" => Ok(Side::Sell),
        other => Err(FeedError::Protocol(format!("bad side: {other:?}"))),
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn pushes_snapshots(&self) -> bool {
        true
    }

    fn ws_url(&self) -> String {
        WS_URL.to_string()
    }

    fn subscribe_frames(&self, feeds: &[Feed]) -> Vec<String> {
        let mut args = Vec::new();
        for feed in feeds {
            match feed {
                Feed::OrderBook => args.push(format!("orderbook.{BOOK_DEPTH}.{}", self.symbol)),
                Feed::Trades => args.push(format!("publicTrade.{}", self.symbol)),
                Feed::Kline => args.push(format!("kline.1.{}", self.symbol)),
                Feed::OpenInterest => args.push(format!("tickers.{}", self.symbol)),
                Feed::Liquidations => args.push(format!("liquidation.{}", self.symbol)),
            }
        }
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn ping_frame(&self) -> Option<String> {
        Some(serde_json::json!({"op": "ping"}).to_string())
    }

    fn parse_message(&self, raw: &str) -> FeedResult<Vec<CanonicalEvent>> {
        let frame: WireFrame = serde_json::from_str(raw)
            .map_err(|e| FeedError::Protocol(format!("frame: {e}")))?;
        let Some(topic) = frame.topic.as_deref() else {
            return Ok(Vec::new()); // op acks, pongs
        };
        let ts = frame.ts.unwrap_or(0);

        if topic.starts_with("orderbook.") {
            let book: WireBook = serde_json::from_value(frame.data)
                .map_err(|e| FeedError::Protocol(format!("orderbook: {e}")))?;
            let update = BookUpdate {
                ts,
                first_update_id: book.update_id,
                last_update_id: book.update_id,
                // Bybit deltas are +1-sequenced per topic.
                prev_update_id: Some(book.update_id - 1),
                bids: parse_levels(&book.bids)?,
                asks: parse_levels(&book.asks)?,
            };
            // u == 1 marks a service-restart snapshot regardless of type.
            let is_snapshot =
                frame.msg_type.as_deref() == Some("snapshot") || book.update_id == 1;
            return Ok(vec![if is_snapshot {
                CanonicalEvent::Snapshot(BookUpdate {
                    prev_update_id: None,
                    ..update
                })
            } else {
                CanonicalEvent::Delta(update)
            }]);
        }

        if topic.starts_with("publicTrade.") {
            let trades: Vec<WireTrade> = serde_json::from_value(frame.data)
                .map_err(|e| FeedError::Protocol(format!("publicTrade: {e}")))?;
            let mut out = Vec::with_capacity(trades.len());
            for t in trades {
                out.push(CanonicalEvent::Trade(Trade {
                    ts: t.ts,
                    trade_id: t.trade_id,
                    side: wire_side(&t.side)?,
                    price: parse_f64(&t.price, "trade price")?,
                    size: parse_f64(&t.size, "trade size")?,
                }));
            }
            return Ok(out);
        }

        if topic.starts_with("kline.") {
            let klines: Vec<WireKline> = serde_json::from_value(frame.data)
                .map_err(|e| FeedError::Protocol(format!("kline: {e}")))?;
            let mut out = Vec::with_capacity(klines.len());
            for k in klines {
                out.push(CanonicalEvent::Kline(Kline {
                    start: k.start,
                    end: k.end,
                    open: parse_f64(&k.open, "open")?,
                    high: parse_f64(&k.high, "high")?,
                    low: parse_f64(&k.low, "low")?,
                    close: parse_f64(&k.close, "close")?,
                    volume: parse_f64(&k.volume, "volume")?,
                    confirm: k.confirm,
                }));
            }
            return Ok(out);
        }

        if topic.starts_with("tickers.") {
            // Ticker deltas only carry changed fields; emit OI when present.
            let t: WireTicker = serde_json::from_value(frame.data)
                .map_err(|e| FeedError::Protocol(format!("tickers: {e}")))?;
            let Some(oi) = t.open_interest else {
                return Ok(Vec::new());
            };
            return Ok(vec![CanonicalEvent::OpenInterest(OpenInterest {
                ts,
                open_interest: parse_f64(&oi, "open interest")?,
                open_interest_value: t
                    .open_interest_value
                    .as_deref()
                    .map(|v| parse_f64(v, "open interest value"))
                    .transpose()?,
            })]);
        }

        if topic.starts_with("liquidation.") {
            let l: WireLiquidation = serde_json::from_value(frame.data)
                .map_err(|e| FeedError::Protocol(format!("liquidation: {e}")))?;
            return Ok(vec![CanonicalEvent::Liquidation(Liquidation {
                ts: l.ts,
                side: wire_side(&l.side)?,
                price: parse_f64(&l.price, "liq price")?,
                qty: parse_f64(&l.size, "liq qty")?,
            })]);
        }

        Ok(Vec::new())
    }

    async fn fetch_snapshot(&self, depth: usize) -> FeedResult<BookUpdate> {
        let limit = depth.min(BOOK_DEPTH);
        let url = format!(
            "{REST_BASE}/v5/market/orderbook?category=linear&symbol={}&limit={limit}",
            self.symbol
        );
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let envelope: RestBookEnvelope = resp
            .json()
            .await
            .map_err(|e| FeedError::Protocol(format!("orderbook snapshot: {e}")))?;
        if envelope.ret_code != 0 {
            return Err(FeedError::Protocol(format!(
                "orderbook snapshot retCode {}",
                envelope.ret_code
            )));
        }
        let book = envelope.result;
        Ok(BookUpdate {
            ts: book.ts,
            first_update_id: book.update_id,
            last_update_id: book.update_id,
            prev_update_id: None,
            bids: parse_levels(&book.bids)?,
            asks: parse_levels(&book.asks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BybitAdapter {
        BybitAdapter::new("BTCUSDT", reqwest::Client::new())
    }

    #[test]
    fn orderbook_snapshot_and_delta_are_distinguished() {
        let snap = r#"{"topic":"orderbook.200.BTCUSDT","type":"snapshot","ts":1700000000000,"data":{"s":"BTCUSDT","b":[["42000.1","2.0"]],"a":[["42000.2","1.0"]],"u":18521288,"seq":7961638724}}"#;
        let events = adapter().parse_message(snap).unwrap();
        assert!(matches!(events[0], CanonicalEvent::Snapshot(_)));

        let delta = r#"{"topic":"orderbook.200.BTCUSDT","type":"delta","ts":1700000000100,"data":{"s":"BTCUSDT","b":[],"a":[["42000.2","0"]],"u":18521289,"seq":7961638725}}"#;
        let events = adapter().parse_message(delta).unwrap();
        let CanonicalEvent::Delta(d) = &events[0] else {
            panic!("expected delta");
        };
        assert_eq!(d.last_update_id, 18521289);
        assert_eq!(d.prev_update_id, Some(18521288));
    }

    #[test]
    fn restart_snapshot_is_detected_by_update_id_one() {
        let raw = r#"{"topic":"orderbook.200.BTCUSDT","type":"delta","ts":1,"data":{"s":"BTCUSDT","b":[],"a":[],"u":1,"seq":2}}"#;
        let events = adapter().parse_message(raw).unwrap();
        assert!(matches!(events[0], CanonicalEvent::Snapshot(_)));
    }

    #[test]
    fn public_trade_batch_maps_taker_side() {
        let raw = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1700000000000,"data":[{"T":1700000000001,"s":"BTCUSDT","S":"Sell","v":"0.010","p":"42000.5","L":"MinusTick","i":"a-b-c","BT":false}]}"#;
        let events = adapter().parse_message(raw).unwrap();
        let CanonicalEvent::Trade(t) = &events[0] else {
            panic!("expected trade");
        };
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.trade_id, "a-b-c");
        assert_eq!(t.price, 42000.5);
    }

    #[test]
    fn ticker_delta_without_oi_is_skipped() {
        let raw = r#"{"topic":"tickers.BTCUSDT","type":"delta","ts":1,"data":{"symbol":"BTCUSDT","markPrice":"42000"}}"#;
        assert!(adapter().parse_message(raw).unwrap().is_empty());

        let with_oi = r#"{"topic":"tickers.BTCUSDT","type":"delta","ts":9,"data":{"openInterest":"5000.5","openInterestValue":"210000000.1"}}"#;
        let events = adapter().parse_message(with_oi).unwrap();
        let CanonicalEvent::OpenInterest(oi) = &events[0] else {
            panic!("expected oi");
        };
        assert_eq!(oi.open_interest, 5000.5);
        assert_eq!(oi.open_interest_value, Some(210000000.1));
    }

    #[test]
    fn op_acks_are_ignored() {
        let raw = r#"{"success":true,"ret_msg":"","conn_id":"x","op":"subscribe"}"#;
        assert!(adapter().parse_message(raw).unwrap().is_empty());
    }
}
