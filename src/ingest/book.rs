//! Local order book: two `BTreeMap` sides keyed by fixed-point price.
//!
//! Prices are keyed as integer 1e-8 ticks so the maps stay strictly ordered
//! without floating-point keys; sizes stay `f64`. Every per-delta operation
//! is O(log N) over book size.

use std::collections::BTreeMap;

use crate::error::{FeedError, FeedResult};
use crate::models::{BookUpdate, DomSnapshot, Level};

const PRICE_SCALE: f64 = 1e8;

#[inline]
pub fn price_key(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

#[inline]
pub fn key_price(key: i64) -> f64 {
    key as f64 / PRICE_SCALE
}

#[derive(Debug, Default, Clone)]
pub struct OrderBook {
    bids: BTreeMap<i64, f64>,
    asks: BTreeMap<i64, f64>,
    pub last_update_id: i64,
    pub ts: i64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|&k| key_price(k))
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|&k| key_price(k))
    }

    /// Replace the whole book from a snapshot.
    pub fn reset(&mut self, snapshot: &BookUpdate) {
        self.bids.clear();
        self.asks.clear();
        for &(price, size) in &snapshot.bids {
            if size > 0.0 {
                self.bids.insert(price_key(price), size);
            }
        }
        for &(price, size) in &snapshot.asks {
            if size > 0.0 {
                self.asks.insert(price_key(price), size);
            }
        }
        self.last_update_id = snapshot.last_update_id;
        self.ts = snapshot.ts;
    }

    /// Apply one validated delta: size 0 removes the level, anything else
    /// upserts it. Sequence continuity is the caller's contract
    /// (`apply_delta` checks it); this only mutates.
    fn apply_levels(&mut self, delta: &BookUpdate) {
        for &(price, size) in &delta.bids {
            let key = price_key(price);
            if size == 0.0 {
                self.bids.remove(&key);
            } else {
                self.bids.insert(key, size);
            }
        }
        for &(price, size) in &delta.asks {
            let key = price_key(price);
            if size == 0.0 {
                self.asks.remove(&key);
            } else {
                self.asks.insert(key, size);
            }
        }
        self.last_update_id = delta.last_update_id;
        self.ts = delta.ts;
    }

    /// Apply a delta with gap detection and post-apply invariant checks.
    pub fn apply_delta(&mut self, delta: &BookUpdate) -> FeedResult<()> {
        if let Some(prev) = delta.prev_update_id {
            if prev != self.last_update_id {
                return Err(FeedError::SequenceGap {
                    expected: self.last_update_id,
                    got: prev,
                });
            }
        }
        self.apply_levels(delta);

        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                return Err(FeedError::Invariant(format!(
                    "crossed book after update {}: best_bid {bid} >= best_ask {ask}",
                    delta.last_update_id
                )));
            }
        }
        Ok(())
    }

    /// Apply a buffered delta without checking continuity against
    /// `last_update_id` — used while draining the buffer after a REST
    /// snapshot, where the first delta's range straddles the snapshot id.
    pub fn apply_unchecked(&mut self, delta: &BookUpdate) {
        self.apply_levels(delta);
    }

    /// Top-N truncated snapshot: bids descending, asks ascending.
    pub fn top_n(&self, depth: usize) -> DomSnapshot {
        let bids: Vec<Level> = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(&k, &s)| (key_price(k), s))
            .collect();
        let asks: Vec<Level> = self
            .asks
            .iter()
            .take(depth)
            .map(|(&k, &s)| (key_price(k), s))
            .collect();
        DomSnapshot {
            ts: self.ts,
            update_id: self.last_update_id,
            bids,
            asks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> BookUpdate {
        BookUpdate {
            ts: 1_700_000_000_000,
            first_update_id: 10,
            last_update_id: 10,
            prev_update_id: None,
            bids: vec![(100.0, 5.0), (99.0, 3.0)],
            asks: vec![(101.0, 2.0), (102.0, 4.0)],
        }
    }

    #[test]
    fn dom_apply_removes_zero_and_upserts() {
        let mut book = OrderBook::new();
        book.reset(&snapshot());

        let delta = BookUpdate {
            ts: 1_700_000_000_100,
            first_update_id: 11,
            last_update_id: 11,
            prev_update_id: Some(10),
            bids: vec![(99.0, 0.0), (98.0, 7.0)],
            asks: vec![],
        };
        book.apply_delta(&delta).unwrap();

        let dom = book.top_n(10);
        assert_eq!(dom.bids, vec![(100.0, 5.0), (98.0, 7.0)]);
        assert_eq!(dom.asks, vec![(101.0, 2.0), (102.0, 4.0)]);
        assert_eq!(dom.update_id, 11);
    }

    #[test]
    fn gap_is_detected_and_nothing_is_applied() {
        // ids 11 then 13 arrive with 12 missing
        let mut book = OrderBook::new();
        book.reset(&snapshot());

        let ok = BookUpdate {
            ts: 1,
            first_update_id: 11,
            last_update_id: 11,
            prev_update_id: Some(10),
            bids: vec![(99.5, 1.0)],
            asks: vec![],
        };
        book.apply_delta(&ok).unwrap();

        let gapped = BookUpdate {
            ts: 2,
            first_update_id: 13,
            last_update_id: 13,
            prev_update_id: Some(12),
            bids: vec![(99.9, 9.0)],
            asks: vec![],
        };
        let err = book.apply_delta(&gapped).unwrap_err();
        assert!(matches!(
            err,
            FeedError::SequenceGap {
                expected: 11,
                got: 12
            }
        ));
        // the gapped delta must not have touched the book
        assert_eq!(book.last_update_id, 11);
        assert!(!book.top_n(10).bids.contains(&(99.9, 9.0)));
    }

    #[test]
    fn crossed_book_is_an_invariant_violation() {
        let mut book = OrderBook::new();
        book.reset(&snapshot());

        let crossing = BookUpdate {
            ts: 3,
            first_update_id: 11,
            last_update_id: 11,
            prev_update_id: Some(10),
            bids: vec![(101.5, 1.0)],
            asks: vec![],
        };
        assert!(matches!(
            book.apply_delta(&crossing),
            Err(FeedError::Invariant(_))
        ));
    }

    #[test]
    fn top_n_truncates_each_side() {
        let mut book = OrderBook::new();
        book.reset(&snapshot());
        let dom = book.top_n(1);
        assert_eq!(dom.bids, vec![(100.0, 5.0)]);
        assert_eq!(dom.asks, vec![(101.0, 2.0)]);
    }

    #[test]
    fn zero_sizes_in_snapshot_are_skipped() {
        let mut book = OrderBook::new();
        book.reset(&BookUpdate {
            ts: 1,
            first_update_id: 1,
            last_update_id: 1,
            prev_update_id: None,
            bids: vec![(100.0, 0.0), (99.0, 1.0)],
            asks: vec![],
        });
        assert_eq!(book.best_bid(), Some(99.0));
    }

    #[test]
    fn fixed_point_keys_are_stable_for_small_ticks() {
        assert_eq!(key_price(price_key(0.00001234)), 0.00001234);
        assert_eq!(key_price(price_key(42123.4)), 42123.4);
    }
}
