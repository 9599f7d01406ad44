//! Binance USDT-margined futures adapter.
//!
//! Uses the combined-stream endpoint so one socket carries depth, aggTrade,
//! kline and forceOrder for the symbol. Binance has no open-interest stream;
//! the adapter polls the REST endpoint instead.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{FeedError, FeedResult};
use crate::models::{
    BookUpdate, CanonicalEvent, Exchange, Feed, Kline, Liquidation, OpenInterest, Side, Trade,
};

use super::{parse_f64, parse_levels, ExchangeAdapter};

const WS_BASE: &str = "wss://fstream.binance.com";
const REST_BASE: &str = "https://fapi.binance.com";
const SNAPSHOT_DEPTH_CAP: usize = 1000;

pub struct BinanceAdapter {
    symbol: String,
    http: reqwest::Client,
}

impl BinanceAdapter {
    pub fn new(symbol: &str, http: reqwest::Client) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            http,
        }
    }

    fn stream_name(&self, feed: Feed) -> Option<String> {
        let sym = self.symbol.to_lowercase();
        match feed {
            Feed::OrderBook => Some(format!("{sym}@depth@100ms")),
            Feed::Trades => Some(format!("{sym}@aggTrade")),
            Feed::Kline => Some(format!("{sym}@kline_1m")),
            Feed::Liquidations => Some(format!("{sym}@forceOrder")),
            Feed::OpenInterest => None, // REST-polled
        }
    }
}

#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireDepthUpdate {
    #[serde(rename = "T")]
    transact_time: i64,
    #[serde(rename = "U")]
    first_update_id: i64,
    #[serde(rename = "u")]
    final_update_id: i64,
    #[serde(rename = "pu")]
    prev_final_update_id: i64,
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireAggTrade {
    #[serde(rename = "a")]
    agg_id: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "T")]
    trade_time: i64,
    /// True when the buyer is the maker, i.e. the aggressor sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct WireKlineWrap {
    #[serde(rename = "k")]
    k: WireKline,
}

#[derive(Debug, Deserialize)]
struct WireKline {
    #[serde(rename = "t")]
    start: i64,
    #[serde(rename = "T")]
    end: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct WireForceOrderWrap {
    #[serde(rename = "o")]
    o: WireForceOrder,
}

#[derive(Debug, Deserialize)]
struct WireForceOrder {
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "ap")]
    avg_price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

#[derive(Debug, Deserialize)]
struct RestDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    #[serde(rename = "T", default)]
    transact_time: i64,
    bids: Vec<Vec<String>>,
    asks: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RestOpenInterest {
    #[serde(rename = "openInterest")]
    open_interest: String,
    time: i64,
}

fn wire_side(raw: &str) -> FeedResult<Side> {
    match raw {
        "BUY" | "Buy" | "buy" => Ok(Side::Buy),
        "SELL" | "Sell" | "sell" => Ok(Side::Sell),
        other => Err(FeedError::Protocol(format!("bad side: {other:?}"))),
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn ws_url(&self) -> String {
        // Subscriptions are baked into the combined-stream URL; every feed
        // this adapter can serve over WS is included and parse_message
        // routes by event type.
        let streams: Vec<String> = Feed::ALL
            .iter()
            .filter_map(|f| self.stream_name(*f))
            .collect();
        format!("{WS_BASE}/stream?streams={}", streams.join("/"))
    }

    fn subscribe_frames(&self, _feeds: &[Feed]) -> Vec<String> {
        Vec::new() // combined streams auto-subscribe
    }

    fn ping_frame(&self) -> Option<String> {
        None // Binance speaks protocol-level ping/pong
    }

    fn parse_message(&self, raw: &str) -> FeedResult<Vec<CanonicalEvent>> {
        let frame: CombinedFrame = serde_json::from_str(raw)
            .map_err(|e| FeedError::Protocol(format!("combined frame: {e}")))?;
        if frame.stream.is_none() {
            return Ok(Vec::new()); // subscription ack / unknown control frame
        }

        let event_type = frame
            .data
            .get("e")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match event_type.as_str() {
            "depthUpdate" => {
                let d: WireDepthUpdate = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("depthUpdate: {e}")))?;
                Ok(vec![CanonicalEvent::Delta(BookUpdate {
                    ts: d.transact_time,
                    first_update_id: d.first_update_id,
                    last_update_id: d.final_update_id,
                    prev_update_id: Some(d.prev_final_update_id),
                    bids: parse_levels(&d.bids)?,
                    asks: parse_levels(&d.asks)?,
                })])
            }
            "aggTrade" => {
                let t: WireAggTrade = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("aggTrade: {e}")))?;
                let side = if t.buyer_is_maker {
                    Side::Sell
                } else {
                    Side::Buy
                };
                Ok(vec![CanonicalEvent::Trade(Trade {
                    ts: t.trade_time,
                    trade_id: t.agg_id.to_string(),
                    side,
                    price: parse_f64(&t.price, "trade price")?,
                    size: parse_f64(&t.qty, "trade size")?,
                })])
            }
            "kline" => {
                let w: WireKlineWrap = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("kline: {e}")))?;
                let k = w.k;
                Ok(vec![CanonicalEvent::Kline(Kline {
                    start: k.start,
                    end: k.end,
                    open: parse_f64(&k.open, "open")?,
                    high: parse_f64(&k.high, "high")?,
                    low: parse_f64(&k.low, "low")?,
                    close: parse_f64(&k.close, "close")?,
                    volume: parse_f64(&k.volume, "volume")?,
                    confirm: k.closed,
                })])
            }
            "forceOrder" => {
                let w: WireForceOrderWrap = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("forceOrder: {e}")))?;
                let o = w.o;
                Ok(vec![CanonicalEvent::Liquidation(Liquidation {
                    ts: o.trade_time,
                    side: wire_side(&o.side)?,
                    price: parse_f64(&o.avg_price, "liq price")?,
                    qty: parse_f64(&o.qty, "liq qty")?,
                })])
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn fetch_snapshot(&self, depth: usize) -> FeedResult<BookUpdate> {
        let limit = depth.min(SNAPSHOT_DEPTH_CAP);
        let url = format!(
            "{REST_BASE}/fapi/v1/depth?symbol={}&limit={limit}",
            self.symbol
        );
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let snap: RestDepth = resp
            .json()
            .await
            .map_err(|e| FeedError::Protocol(format!("depth snapshot: {e}")))?;
        Ok(BookUpdate {
            ts: snap.transact_time,
            first_update_id: snap.last_update_id,
            last_update_id: snap.last_update_id,
            prev_update_id: None,
            bids: parse_levels(&snap.bids)?,
            asks: parse_levels(&snap.asks)?,
        })
    }

    fn oi_poll_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(15))
    }

    async fn fetch_open_interest(&self) -> FeedResult<Option<OpenInterest>> {
        let url = format!("{REST_BASE}/fapi/v1/openInterest?symbol={}", self.symbol);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let oi: RestOpenInterest = resp
            .json()
            .await
            .map_err(|e| FeedError::Protocol(format!("openInterest: {e}")))?;
        Ok(Some(OpenInterest {
            ts: oi.time,
            open_interest: parse_f64(&oi.open_interest, "open interest")?,
            open_interest_value: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new("btcusdt", reqwest::Client::new())
    }

    #[test]
    fn depth_update_becomes_delta_with_venue_ids_untouched() {
        let raw = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1700000000100,"T":1700000000099,"s":"BTCUSDT","U":101,"u":105,"pu":100,"b":[["42000.10","1.5"]],"a":[["42000.20","0.0"]]}}"#;
        let events = adapter().parse_message(raw).unwrap();
        assert_eq!(events.len(), 1);
        let CanonicalEvent::Delta(d) = &events[0] else {
            panic!("expected delta");
        };
        assert_eq!(d.first_update_id, 101);
        assert_eq!(d.last_update_id, 105);
        assert_eq!(d.prev_update_id, Some(100));
        assert_eq!(d.bids, vec![(42000.10, 1.5)]);
        assert_eq!(d.asks, vec![(42000.20, 0.0)]);
    }

    #[test]
    fn agg_trade_aggressor_comes_from_maker_flag() {
        let raw = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"BTCUSDT","a":7,"p":"42000.5","q":"0.25","f":1,"l":2,"T":1700000000000,"m":true}}"#;
        let events = adapter().parse_message(raw).unwrap();
        let CanonicalEvent::Trade(t) = &events[0] else {
            panic!("expected trade");
        };
        // buyer was maker -> seller was the aggressor
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.trade_id, "7");
        assert_eq!(t.ts, 1700000000000);
    }

    #[test]
    fn control_frames_yield_no_events() {
        // no "stream" key -> subscription ack or similar
        let events = adapter().parse_message(r#"{"data":{},"id":1}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_depth_is_a_protocol_error() {
        let raw = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","b":"nope"}}"#;
        assert!(matches!(
            adapter().parse_message(raw),
            Err(FeedError::Protocol(_))
        ));
    }

    #[test]
    fn ws_url_carries_all_streams() {
        let url = adapter().ws_url();
        assert!(url.contains("btcusdt@depth@100ms"));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("btcusdt@forceOrder"));
    }
}
