//! OKX v5 perpetual-swap adapter.
//!
//! Owns the symbol mapping between the canonical compact form (`BTCUSDT`)
//! and OKX instrument ids (`BTC-USDT-SWAP`). The books channel pushes a
//! snapshot on subscribe, then seqId-chained updates.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{FeedError, FeedResult};
use crate::models::{
    BookUpdate, CanonicalEvent, Exchange, Feed, Kline, Liquidation, OpenInterest, Side, Trade,
};

use super::{parse_f64, parse_levels, ExchangeAdapter};

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_BASE: &str = "https://www.okx.com";
const MINUTE_MS: i64 = 60_000;

pub struct OkxAdapter {
    symbol: String,
    inst_id: String,
    http: reqwest::Client,
}

impl OkxAdapter {
    pub fn new(symbol: &str, http: reqwest::Client) -> Self {
        let symbol = symbol.to_uppercase();
        let inst_id = to_inst_id(&symbol);
        Self {
            symbol,
            inst_id,
            http,
        }
    }
}

/// `BTCUSDT` -> `BTC-USDT-SWAP`. Quote currency is one of the USD-family
/// stables; anything else is passed through with a dash before the last
/// four characters as a best effort.
fn to_inst_id(symbol: &str) -> String {
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-{quote}-SWAP");
            }
        }
    }
    let (base, quote) = symbol.split_at(symbol.len().saturating_sub(4));
    format!("{base}-{quote}-SWAP")
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    /// Present on subscribe acks and error events, absent on data frames.
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    arg: Option<WireArg>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireArg {
    channel: String,
    #[serde(rename = "instId", default)]
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireBook {
    asks: Vec<Vec<String>>,
    bids: Vec<Vec<String>>,
    ts: String,
    #[serde(rename = "seqId")]
    seq_id: i64,
    #[serde(rename = "prevSeqId", default)]
    prev_seq_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    px: String,
    sz: String,
    side: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct WireOpenInterest {
    oi: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct WireLiquidationOrder {
    #[serde(rename = "instId", default)]
    inst_id: Option<String>,
    details: Vec<WireLiquidationDetail>,
}

#[derive(Debug, Deserialize)]
struct WireLiquidationDetail {
    side: String,
    sz: String,
    #[serde(rename = "bkPx")]
    bk_px: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct RestBooksEnvelope {
    code: String,
    data: Vec<RestBook>,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    asks: Vec<Vec<String>>,
    bids: Vec<Vec<String>>,
    ts: String,
}

fn wire_side(raw: &str) -> FeedResult<Side> {
    match raw {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(FeedError::Protocol(format!("bad side: {other:?}"))),
    }
}

fn parse_ms(raw: &str) -> FeedResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| FeedError::Protocol(format!("bad timestamp: {raw:?}")))
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
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
            let arg = match feed {
                Feed::OrderBook => {
                    serde_json::json!({"channel": "books", "instId": self.inst_id})
                }
                Feed::Trades => serde_json::json!({"channel": "trades", "instId": self.inst_id}),
                Feed::Kline => serde_json::json!({"channel": "candle1m", "instId": self.inst_id}),
                Feed::OpenInterest => {
                    serde_json::json!({"channel": "open-interest", "instId": self.inst_id})
                }
                Feed::Liquidations => {
                    serde_json::json!({"channel": "liquidation-orders", "instType": "SWAP"})
                }
            };
            args.push(arg);
        }
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn ping_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn ping_interval(&self) -> Duration {
        // OKX drops idle sockets at 30 s.
        Duration::from_secs(25)
    }

    fn parse_message(&self, raw: &str) -> FeedResult<Vec<CanonicalEvent>> {
        if raw == "pong" {
            return Ok(Vec::new());
        }
        let frame: WireFrame = serde_json::from_str(raw)
            .map_err(|e| FeedError::Protocol(format!("frame: {e}")))?;
        if frame.event.is_some() {
            return Ok(Vec::new()); // subscribe acks, error events
        }
        let Some(arg) = &frame.arg else {
            return Ok(Vec::new());
        };

        match arg.channel.as_str() {
            "books" => {
                let books: Vec<WireBook> = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("books: {e}")))?;
                let is_snapshot = frame.action.as_deref() == Some("snapshot");
                let mut out = Vec::with_capacity(books.len());
                for b in books {
                    let update = BookUpdate {
                        ts: parse_ms(&b.ts)?,
                        first_update_id: b.seq_id,
                        last_update_id: b.seq_id,
                        prev_update_id: if is_snapshot { None } else { b.prev_seq_id },
                        bids: parse_levels(&b.bids)?,
                        asks: parse_levels(&b.asks)?,
                    };
                    out.push(if is_snapshot {
                        CanonicalEvent::Snapshot(update)
                    } else {
                        CanonicalEvent::Delta(update)
                    });
                }
                Ok(out)
            }
            "trades" => {
                let trades: Vec<WireTrade> = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("trades: {e}")))?;
                let mut out = Vec::with_capacity(trades.len());
                for t in trades {
                    out.push(CanonicalEvent::Trade(Trade {
                        ts: parse_ms(&t.ts)?,
                        trade_id: t.trade_id,
                        side: wire_side(&t.side)?,
                        price: parse_f64(&t.px, "trade price")?,
                        size: parse_f64(&t.sz, "trade size")?,
                    }));
                }
                Ok(out)
            }
            "candle1m" => {
                let rows: Vec<Vec<String>> = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("candle1m: {e}")))?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    if row.len() < 6 {
                        return Err(FeedError::Protocol(format!("short candle row: {row:?}")));
                    }
                    let start = parse_ms(&row[0])?;
                    // confirm flag is the trailing column on v5 candles
                    let confirm = row.last().map(|v| v == "1").unwrap_or(false);
                    out.push(CanonicalEvent::Kline(Kline {
                        start,
                        end: start + MINUTE_MS,
                        open: parse_f64(&row[1], "open")?,
                        high: parse_f64(&row[2], "high")?,
                        low: parse_f64(&row[3], "low")?,
                        close: parse_f64(&row[4], "close")?,
                        volume: parse_f64(&row[5], "volume")?,
                        confirm,
                    }));
                }
                Ok(out)
            }
            "open-interest" => {
                let rows: Vec<WireOpenInterest> = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("open-interest: {e}")))?;
                let mut out = Vec::with_capacity(rows.len());
                for r in rows {
                    out.push(CanonicalEvent::OpenInterest(OpenInterest {
                        ts: parse_ms(&r.ts)?,
                        open_interest: parse_f64(&r.oi, "open interest")?,
                        open_interest_value: None,
                    }));
                }
                Ok(out)
            }
            "liquidation-orders" => {
                // Channel is per instType; keep only our instrument.
                let orders: Vec<WireLiquidationOrder> = serde_json::from_value(frame.data)
                    .map_err(|e| FeedError::Protocol(format!("liquidation-orders: {e}")))?;
                let mut out = Vec::new();
                for order in orders {
                    if order.inst_id.as_deref() != Some(self.inst_id.as_str()) {
                        continue;
                    }
                    for d in order.details {
                        out.push(CanonicalEvent::Liquidation(Liquidation {
                            ts: parse_ms(&d.ts)?,
                            side: wire_side(&d.side)?,
                            price: parse_f64(&d.bk_px, "liq price")?,
                            qty: parse_f64(&d.sz, "liq qty")?,
                        }));
                    }
                }
                Ok(out)
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn fetch_snapshot(&self, depth: usize) -> FeedResult<BookUpdate> {
        // The REST books endpoint carries no seqId, so the snapshot is
        // unsequenced (update ids 0): the ingestor re-anchors its chain on
        // the first delta after applying it. The books channel snapshot,
        // when one arrives, is the sequenced fast path.
        let limit = depth.min(400);
        let url = format!("{REST_BASE}/api/v5/market/books?instId={}&sz={limit}", self.inst_id);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let envelope: RestBooksEnvelope = resp
            .json()
            .await
            .map_err(|e| FeedError::Protocol(format!("books snapshot: {e}")))?;
        if envelope.code != "0" {
            return Err(FeedError::Protocol(format!(
                "books snapshot code {}",
                envelope.code
            )));
        }
        let book = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| FeedError::Protocol("books snapshot: empty data".to_string()))?;
        Ok(BookUpdate {
            ts: parse_ms(&book.ts)?,
            first_update_id: 0,
            last_update_id: 0,
            prev_update_id: None,
            bids: parse_levels(&book.bids)?,
            asks: parse_levels(&book.asks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OkxAdapter {
        OkxAdapter::new("BTCUSDT", reqwest::Client::new())
    }

    #[test]
    fn symbol_mapping_is_owned_by_the_adapter() {
        assert_eq!(to_inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(to_inst_id("ETHUSDC"), "ETH-USDC-SWAP");
        let a = adapter();
        assert_eq!(a.symbol(), "BTCUSDT");
        assert_eq!(a.inst_id, "BTC-USDT-SWAP");
    }

    #[test]
    fn books_update_carries_the_seq_chain() {
        let raw = r#"{"arg":{"channel":"books","instId":"BTC-USDT-SWAP"},"action":"update","data":[{"asks":[["42001.0","5","0","1"]],"bids":[["41999.0","2","0","1"]],"ts":"1700000000123","checksum":-1404728904,"prevSeqId":10,"seqId":11}]}"#;
        let events = adapter().parse_message(raw).unwrap();
        let CanonicalEvent::Delta(d) = &events[0] else {
            panic!("expected delta");
        };
        assert_eq!(d.last_update_id, 11);
        assert_eq!(d.prev_update_id, Some(10));
        assert_eq!(d.ts, 1700000000123);
        // extra columns on levels are ignored
        assert_eq!(d.asks, vec![(42001.0, 5.0)]);
    }

    #[test]
    fn books_snapshot_resets_the_chain() {
        let raw = r#"{"arg":{"channel":"books","instId":"BTC-USDT-SWAP"},"action":"snapshot","data":[{"asks":[],"bids":[],"ts":"1","checksum":1,"prevSeqId":-1,"seqId":42}]}"#;
        let events = adapter().parse_message(raw).unwrap();
        let CanonicalEvent::Snapshot(s) = &events[0] else {
            panic!("expected snapshot");
        };
        assert_eq!(s.last_update_id, 42);
        assert_eq!(s.prev_update_id, None);
    }

    #[test]
    fn candle_confirm_flag_is_last_column() {
        let raw = r#"{"arg":{"channel":"candle1m","instId":"BTC-USDT-SWAP"},"data":[["1700000040000","42000","42100","41950","42050","104","104","4368000","1"]]}"#;
        let events = adapter().parse_message(raw).unwrap();
        let CanonicalEvent::Kline(k) = &events[0] else {
            panic!("expected kline");
        };
        assert!(k.confirm);
        assert_eq!(k.end, k.start + MINUTE_MS);
    }

    #[test]
    fn foreign_instrument_liquidations_are_filtered() {
        let raw = r#"{"arg":{"channel":"liquidation-orders","instType":"SWAP"},"data":[{"instId":"ETH-USDT-SWAP","details":[{"side":"buy","sz":"10","bkPx":"2000","ts":"1"}]}]}"#;
        assert!(adapter().parse_message(raw).unwrap().is_empty());
    }

    #[test]
    fn plain_pong_is_ignored() {
        assert!(adapter().parse_message("pong").unwrap().is_empty());
    }
}
