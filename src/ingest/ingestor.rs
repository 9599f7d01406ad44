//! Per-(exchange, symbol) ingestor: snapshot → delta-apply loop with gap
//! detection and resnapshot.
//!
//! The sync algorithm is the same for every venue: buffer live deltas,
//! fetch a REST snapshot through the adapter, drop buffered deltas at or
//! before the snapshot id and reconcile the rest against it. Venues whose
//! book topic pushes a WS snapshot on (re)subscribe (Bybit, OKX) use that
//! as a fast path — it completes the same synchronization early, and the
//! in-flight REST result is then discarded as stale. A REST snapshot
//! without a venue sequence id (OKX books endpoint) re-anchors the chain
//! on the first live delta instead of id-matching.
//!
//! Trades, klines, open interest and liquidations flow to their streams
//! independent of book state.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::error::{FeedError, FeedResult};
use crate::exchanges::{spawn_feed, ExchangeAdapter, FeedHandle};
use crate::models::{kind, BookUpdate, CanonicalEvent, Feed, Instrument};
use crate::supervisor::{TaskRegistry, TaskState};

use super::book::OrderBook;

/// Live deltas buffered while a REST snapshot is in flight. Beyond this the
/// sync attempt is considered wedged and restarted.
const SYNC_BUFFER_CAP: usize = 10_000;
const TRADE_DEDUP_CAP: usize = 4_096;
const APPEND_RETRIES: u32 = 3;

#[derive(Debug, Default)]
pub struct IngestorStats {
    pub doms_published: AtomicU64,
    pub trades_published: AtomicU64,
    pub trades_deduped: AtomicU64,
    pub gaps: AtomicU64,
    pub invariant_violations: AtomicU64,
    pub resnapshots: AtomicU64,
    pub broker_errors: AtomicU64,
}

enum BookPhase {
    /// Snapshot requested, deltas buffering. Left either by the REST
    /// reconcile or by a venue-pushed snapshot, whichever lands first.
    AwaitSnapshot { buffer: Vec<BookUpdate> },
    Live,
}

/// How the first live deltas after a sync are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeamRule {
    /// Normal operation: `prev_update_id` must equal the applied id.
    Strict,
    /// Synced from a sequenced snapshot with nothing buffered past it:
    /// the first delta must straddle `snapshot_id + 1`.
    Straddle,
    /// Synced from an unsequenced snapshot: the first delta is applied
    /// as-is and re-anchors the id chain.
    Anchor,
}

/// Outcome of reconciling buffered deltas against a REST snapshot.
#[derive(Debug, PartialEq, Eq)]
enum Reconcile {
    Synced { seam: SeamRule },
    /// Snapshot and buffer do not join up; fetch a new snapshot.
    Restart,
}

fn reconcile_buffer(
    book: &mut OrderBook,
    snapshot: &BookUpdate,
    buffer: &[BookUpdate],
) -> Reconcile {
    book.reset(snapshot);
    let snap_id = snapshot.last_update_id;

    if snap_id <= 0 {
        // No venue sequence on this snapshot (OKX REST books): buffered
        // deltas cannot be ordered against it, so the first live delta
        // re-anchors the chain.
        return Reconcile::Synced {
            seam: SeamRule::Anchor,
        };
    }

    let pending: Vec<&BookUpdate> = buffer
        .iter()
        .filter(|d| d.last_update_id > snap_id)
        .collect();
    let Some(first) = pending.first() else {
        // Nothing newer buffered yet; the first live delta must straddle
        // the snapshot id.
        return Reconcile::Synced {
            seam: SeamRule::Straddle,
        };
    };

    let lo = first.prev_update_id.unwrap_or(first.first_update_id);
    let hi = pending.last().map(|d| d.last_update_id).unwrap_or(snap_id);
    if !(lo <= snap_id + 1 && snap_id + 1 <= hi) {
        return Reconcile::Restart;
    }

    let mut last = None;
    for delta in &pending {
        if let (Some(prev), Some(last_applied)) = (delta.prev_update_id, last) {
            if prev != last_applied {
                return Reconcile::Restart; // hole inside the buffer itself
            }
        }
        book.apply_unchecked(delta);
        last = Some(delta.last_update_id);
    }

    if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
        if bid >= ask {
            return Reconcile::Restart;
        }
    }
    Reconcile::Synced {
        seam: SeamRule::Strict,
    }
}

/// First live delta after an empty-buffer sync: accept if its id range
/// covers `last_update_id + 1`, skip if it is entirely old, gap otherwise.
fn apply_straddling(book: &mut OrderBook, delta: &BookUpdate) -> FeedResult<bool> {
    if delta.last_update_id <= book.last_update_id {
        return Ok(false);
    }
    if delta.first_update_id > book.last_update_id + 1 {
        return Err(FeedError::SequenceGap {
            expected: book.last_update_id,
            got: delta.first_update_id,
        });
    }
    book.apply_unchecked(delta);
    check_not_crossed(book, delta.last_update_id)?;
    Ok(true)
}

/// First live delta after an unsequenced snapshot: applied as-is, the
/// venue ids take over from here.
fn apply_anchoring(book: &mut OrderBook, delta: &BookUpdate) -> FeedResult<bool> {
    book.apply_unchecked(delta);
    check_not_crossed(book, delta.last_update_id)?;
    Ok(true)
}

fn check_not_crossed(book: &OrderBook, update_id: i64) -> FeedResult<()> {
    if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
        if bid >= ask {
            return Err(FeedError::Invariant(format!(
                "crossed book after update {update_id}: best_bid {bid} >= best_ask {ask}"
            )));
        }
    }
    Ok(())
}

/// Ring of recently seen trade ids: venue reconnects can replay the tail
/// of the tape, and downstream must observe each id at most once.
struct TradeDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl TradeDedup {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Returns true the first time an id is seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Snapshot results are tagged with a generation so a fetch made obsolete
/// by a venue snapshot or a newer resync is ignored when it lands.
type SnapshotResult = (u64, FeedResult<BookUpdate>);

pub struct Ingestor {
    instrument: Instrument,
    adapter: Arc<dyn ExchangeAdapter>,
    broker: Broker,
    cfg: Arc<Config>,
    registry: TaskRegistry,
    pub stats: Arc<IngestorStats>,
}

impl Ingestor {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        broker: Broker,
        cfg: Arc<Config>,
        registry: TaskRegistry,
    ) -> Self {
        let instrument = Instrument::new(adapter.exchange(), adapter.symbol());
        Self {
            instrument,
            adapter,
            broker,
            cfg,
            registry,
            stats: Arc::new(IngestorStats::default()),
        }
    }

    pub fn task_name(&self) -> String {
        format!("ingestor:{}", self.instrument)
    }

    pub async fn run(mut self, cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.task_name();
        self.registry.set_state(&name, TaskState::Running);

        let feeds = Feed::ALL.to_vec();
        let mut feed = spawn_feed(self.adapter.clone(), feeds, cancel.clone());

        // REST snapshot results come back through a channel the select loop
        // can wait on; a sender is kept alive so recv() never ends.
        let (snap_tx, mut snap_rx) = mpsc::channel::<SnapshotResult>(1);

        let mut book = OrderBook::new();
        let mut snap_gen: u64 = 0;
        self.spawn_snapshot_fetch(snap_gen, &snap_tx);
        let mut phase = BookPhase::AwaitSnapshot { buffer: Vec::new() };
        let mut seam = SeamRule::Strict;
        let mut dedup = TradeDedup::new(TRADE_DEDUP_CAP);
        let mut resnapshot_times: VecDeque<Instant> = VecDeque::new();
        let mut cancel = cancel;
        let mut hb = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!(task = %name, "ingestor cancelled");
                        return Ok(());
                    }
                }
                _ = hb.tick() => {
                    self.registry.heartbeat(&name);
                }
                Some((gen, res)) = snap_rx.recv() => {
                    if gen != snap_gen {
                        debug!(task = %name, gen, "stale snapshot fetch ignored");
                        continue;
                    }
                    if matches!(phase, BookPhase::Live) {
                        // A venue-pushed snapshot won the race.
                        debug!(task = %name, "snapshot fetch superseded by venue snapshot");
                        continue;
                    }
                    let snapshot = match res {
                        Ok(s) => s,
                        Err(e) => {
                            // Retries exhausted and the book is still not
                            // synced: escalate so the supervisor parks and
                            // restarts this symbol.
                            self.registry.set_state(&name, TaskState::Failed);
                            return Err(anyhow::anyhow!("snapshot fetch failed for {}: {e}", self.instrument));
                        }
                    };
                    let buffer = match &mut phase {
                        BookPhase::AwaitSnapshot { buffer } => std::mem::take(buffer),
                        BookPhase::Live => Vec::new(),
                    };
                    match reconcile_buffer(&mut book, &snapshot, &buffer) {
                        Reconcile::Synced { seam: s } => {
                            seam = s;
                            phase = BookPhase::Live;
                            info!(
                                task = %name,
                                snapshot_id = snapshot.last_update_id,
                                buffered = buffer.len(),
                                "book synchronized from REST snapshot"
                            );
                            self.publish_dom(&book).await;
                        }
                        Reconcile::Restart => {
                            warn!(task = %name, snapshot_id = snapshot.last_update_id, "snapshot does not join buffered deltas, refetching");
                            phase = BookPhase::AwaitSnapshot { buffer: Vec::new() };
                            snap_gen += 1;
                            self.spawn_snapshot_fetch(snap_gen, &snap_tx);
                        }
                    }
                }
                event = feed.events.recv() => {
                    let Some(event) = event else {
                        self.registry.set_state(&name, TaskState::Failed);
                        return Err(anyhow::anyhow!("feed task for {} ended", self.instrument));
                    };
                    self.handle_event(
                        event,
                        &mut book,
                        &mut phase,
                        &mut seam,
                        &mut snap_gen,
                        &mut dedup,
                        &mut resnapshot_times,
                        &snap_tx,
                        &mut feed,
                        &name,
                    )
                    .await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_event(
        &mut self,
        event: CanonicalEvent,
        book: &mut OrderBook,
        phase: &mut BookPhase,
        seam: &mut SeamRule,
        snap_gen: &mut u64,
        dedup: &mut TradeDedup,
        resnapshot_times: &mut VecDeque<Instant>,
        snap_tx: &mpsc::Sender<SnapshotResult>,
        feed: &mut FeedHandle,
        name: &str,
    ) {
        match event {
            CanonicalEvent::Snapshot(snapshot) => {
                // Venue-pushed snapshot: same sync point, no REST round
                // trip. Anything buffered arrived before it on the socket
                // and is obsolete; an in-flight fetch is invalidated by
                // bumping the generation.
                book.reset(&snapshot);
                *phase = BookPhase::Live;
                *seam = SeamRule::Strict;
                *snap_gen += 1;
                info!(task = %name, snapshot_id = snapshot.last_update_id, "venue snapshot applied");
                self.publish_dom(book).await;
            }
            CanonicalEvent::Delta(delta) => match &mut *phase {
                BookPhase::AwaitSnapshot { buffer } => {
                    buffer.push(delta);
                    if buffer.len() > SYNC_BUFFER_CAP {
                        warn!(task = %name, "sync buffer overflow, restarting snapshot");
                        buffer.clear();
                        *snap_gen += 1;
                        self.spawn_snapshot_fetch(*snap_gen, snap_tx);
                    }
                }
                BookPhase::Live => {
                    let applied = match *seam {
                        SeamRule::Strict => book.apply_delta(&delta).map(|_| true),
                        SeamRule::Straddle => apply_straddling(book, &delta),
                        SeamRule::Anchor => apply_anchoring(book, &delta),
                    };
                    match applied {
                        Ok(true) => {
                            *seam = SeamRule::Strict;
                            self.publish_dom(book).await;
                        }
                        Ok(false) => {}
                        Err(FeedError::SequenceGap { expected, got }) => {
                            self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                            warn!(task = %name, expected, got, "sequence gap, resynchronizing");
                            self.trigger_resync(phase, snap_gen, resnapshot_times, snap_tx, feed, name)
                                .await;
                        }
                        Err(FeedError::Invariant(reason)) => {
                            self.stats
                                .invariant_violations
                                .fetch_add(1, Ordering::Relaxed);
                            error!(
                                task = %name,
                                reason,
                                update_id = delta.last_update_id,
                                ts = delta.ts,
                                "book invariant violated, resynchronizing"
                            );
                            self.trigger_resync(phase, snap_gen, resnapshot_times, snap_tx, feed, name)
                                .await;
                        }
                        Err(e) => {
                            warn!(task = %name, error = %e, "unexpected apply error");
                        }
                    }
                }
            },
            CanonicalEvent::Trade(trade) => {
                if !dedup.insert(&trade.trade_id) {
                    self.stats.trades_deduped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let payload = match serde_json::to_string(&trade) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(task = %name, error = %e, "trade serialize failed");
                        return;
                    }
                };
                self.append_with_retry(
                    &self.instrument.trades_stream(),
                    kind::TRADE,
                    trade.ts,
                    &payload,
                    self.cfg.trades_stream_maxlen,
                )
                .await;
                self.stats.trades_published.fetch_add(1, Ordering::Relaxed);
            }
            CanonicalEvent::Kline(kline) => {
                if let Ok(payload) = serde_json::to_string(&kline) {
                    self.append_with_retry(
                        &self.instrument.kline_stream(),
                        kind::KLINE,
                        kline.start,
                        &payload,
                        self.cfg.trades_stream_maxlen,
                    )
                    .await;
                }
            }
            CanonicalEvent::OpenInterest(oi) => {
                if let Ok(payload) = serde_json::to_string(&oi) {
                    self.append_with_retry(
                        &self.instrument.oi_stream(),
                        kind::OPEN_INTEREST,
                        oi.ts,
                        &payload,
                        self.cfg.trades_stream_maxlen,
                    )
                    .await;
                }
            }
            CanonicalEvent::Liquidation(liq) => {
                if let Ok(payload) = serde_json::to_string(&liq) {
                    self.append_with_retry(
                        &self.instrument.liq_stream(),
                        kind::LIQUIDATION,
                        liq.ts,
                        &payload,
                        self.cfg.trades_stream_maxlen,
                    )
                    .await;
                }
            }
        }
    }

    /// Gap or invariant failure in Live: back to buffering with a fresh
    /// REST snapshot in flight. Venues that resend a WS snapshot on
    /// resubscribe also get a redial nudge, so whichever sync point lands
    /// first wins. Tracks the resnapshot rate and trips the instability
    /// flag.
    async fn trigger_resync(
        &mut self,
        phase: &mut BookPhase,
        snap_gen: &mut u64,
        resnapshot_times: &mut VecDeque<Instant>,
        snap_tx: &mpsc::Sender<SnapshotResult>,
        feed: &mut FeedHandle,
        name: &str,
    ) {
        self.stats.resnapshots.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        resnapshot_times.push_back(now);
        while let Some(front) = resnapshot_times.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                resnapshot_times.pop_front();
            } else {
                break;
            }
        }
        if resnapshot_times.len() as u32 > self.cfg.resnapshot_alarm_per_min {
            warn!(task = %name, per_min = resnapshot_times.len(), "venue unstable: resnapshot rate exceeded");
            self.registry.set_state(name, TaskState::Unstable);
        }

        *phase = BookPhase::AwaitSnapshot { buffer: Vec::new() };
        *snap_gen += 1;
        self.spawn_snapshot_fetch(*snap_gen, snap_tx);
        if self.adapter.pushes_snapshots() {
            let _ = feed.resync.try_send(());
        }
    }

    fn spawn_snapshot_fetch(&self, gen: u64, snap_tx: &mpsc::Sender<SnapshotResult>) {
        let adapter = self.adapter.clone();
        let depth = self.cfg.book_depth.max(500); // venue-recommended sync depth
        let retries = self.cfg.snapshot_retries;
        let tx = snap_tx.clone();
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(500);
            let mut last_err = None;
            for attempt in 1..=retries {
                match adapter.fetch_snapshot(depth).await {
                    Ok(snapshot) => {
                        let _ = tx.send((gen, Ok(snapshot))).await;
                        return;
                    }
                    Err(e) => {
                        warn!(
                            exchange = %adapter.exchange(),
                            symbol = adapter.symbol(),
                            attempt,
                            error = %e,
                            "snapshot fetch failed"
                        );
                        last_err = Some(e);
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(10));
                    }
                }
            }
            let err = last_err
                .unwrap_or_else(|| FeedError::Transport("snapshot retries exhausted".to_string()));
            let _ = tx.send((gen, Err(err))).await;
        });
    }

    async fn publish_dom(&self, book: &OrderBook) {
        let dom = book.top_n(self.cfg.book_depth);
        let payload = match serde_json::to_string(&dom) {
            Ok(p) => p,
            Err(e) => {
                warn!(instrument = %self.instrument, error = %e, "dom serialize failed");
                return;
            }
        };
        self.append_with_retry(
            &self.instrument.dom_stream(),
            kind::DOM,
            dom.ts,
            &payload,
            self.cfg.dom_stream_maxlen,
        )
        .await;
        self.stats.doms_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Transport failures are retried with a short capped backoff; after
    /// that the record is dropped and counted — the stream is a rolling
    /// window, not an archive.
    async fn append_with_retry(
        &self,
        stream: &str,
        record_kind: &str,
        ts: i64,
        payload: &str,
        maxlen: usize,
    ) {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..APPEND_RETRIES {
            match self
                .broker
                .stream_append(stream, record_kind, ts, payload, maxlen)
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    if attempt + 1 == APPEND_RETRIES {
                        warn!(stream, error = %e, "stream append dropped after retries");
                        self.stats.broker_errors.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: i64) -> BookUpdate {
        BookUpdate {
            ts: 1_000,
            first_update_id: id,
            last_update_id: id,
            prev_update_id: None,
            bids: vec![(100.0, 5.0), (99.0, 3.0)],
            asks: vec![(101.0, 2.0), (102.0, 4.0)],
        }
    }

    fn delta(first: i64, last: i64, prev: i64, bids: Vec<(f64, f64)>) -> BookUpdate {
        BookUpdate {
            ts: 1_100,
            first_update_id: first,
            last_update_id: last,
            prev_update_id: Some(prev),
            bids,
            asks: vec![],
        }
    }

    #[test]
    fn reconcile_drops_stale_and_applies_covering_deltas() {
        let mut book = OrderBook::new();
        let buffer = vec![
            delta(8, 9, 7, vec![(97.0, 9.0)]),             // stale, dropped
            delta(10, 11, 9, vec![(99.0, 0.0), (98.0, 7.0)]), // straddles snap_id+1
            delta(12, 12, 11, vec![(98.5, 1.0)]),
        ];
        let out = reconcile_buffer(&mut book, &snap(10), &buffer);
        assert_eq!(
            out,
            Reconcile::Synced {
                seam: SeamRule::Strict
            }
        );
        let dom = book.top_n(10);
        assert!(!dom.bids.contains(&(97.0, 9.0)));
        assert!(dom.bids.contains(&(98.0, 7.0)));
        assert!(dom.bids.contains(&(98.5, 1.0)));
        assert_eq!(book.last_update_id, 12);
    }

    #[test]
    fn reconcile_restarts_when_buffer_starts_past_snapshot() {
        // Snapshot is older than anything we buffered: the join point is
        // missing, so a fresh snapshot is required.
        let mut book = OrderBook::new();
        let buffer = vec![delta(200, 201, 199, vec![(99.5, 1.0)])];
        assert_eq!(reconcile_buffer(&mut book, &snap(100), &buffer), Reconcile::Restart);
    }

    #[test]
    fn reconcile_restarts_on_hole_inside_buffer() {
        let mut book = OrderBook::new();
        let buffer = vec![
            delta(10, 11, 9, vec![(99.5, 1.0)]),
            delta(14, 15, 13, vec![(99.6, 1.0)]), // 12-13 missing
        ];
        assert_eq!(reconcile_buffer(&mut book, &snap(10), &buffer), Reconcile::Restart);
    }

    #[test]
    fn reconcile_with_empty_buffer_defers_to_straddle_rule() {
        let mut book = OrderBook::new();
        let out = reconcile_buffer(&mut book, &snap(10), &[]);
        assert_eq!(
            out,
            Reconcile::Synced {
                seam: SeamRule::Straddle
            }
        );

        // entirely-old delta is skipped
        let old = delta(9, 10, 8, vec![(42.0, 1.0)]);
        assert!(!apply_straddling(&mut book, &old).unwrap());

        // delta covering snap_id+1 applies
        let covering = delta(10, 12, 9, vec![(98.0, 7.0)]);
        assert!(apply_straddling(&mut book, &covering).unwrap());
        assert_eq!(book.last_update_id, 12);

        // delta starting beyond snap_id+1 would have been a gap
        let mut book2 = OrderBook::new();
        reconcile_buffer(&mut book2, &snap(10), &[]);
        let beyond = delta(13, 14, 12, vec![(98.0, 7.0)]);
        assert!(matches!(
            apply_straddling(&mut book2, &beyond),
            Err(FeedError::SequenceGap { .. })
        ));
    }

    #[test]
    fn unsequenced_snapshot_anchors_on_first_delta() {
        // A snapshot without a venue sequence id (OKX REST books) cannot
        // be id-matched against buffered deltas; the first live delta
        // re-anchors the chain and strict checking resumes from its id.
        let mut book = OrderBook::new();
        let unsequenced = BookUpdate {
            last_update_id: 0,
            first_update_id: 0,
            ..snap(0)
        };
        let buffered = vec![delta(7, 8, 6, vec![(42.0, 1.0)])];
        let out = reconcile_buffer(&mut book, &unsequenced, &buffered);
        assert_eq!(
            out,
            Reconcile::Synced {
                seam: SeamRule::Anchor
            }
        );
        // buffered deltas were not applied
        assert!(!book.top_n(10).bids.contains(&(42.0, 1.0)));

        let first_live = delta(41, 42, 40, vec![(98.0, 7.0)]);
        assert!(apply_anchoring(&mut book, &first_live).unwrap());
        assert_eq!(book.last_update_id, 42);

        // from here the strict rule holds: 44 does not chain onto 42
        let gapped = delta(44, 44, 43, vec![(98.5, 1.0)]);
        assert!(matches!(
            book.apply_delta(&gapped),
            Err(FeedError::SequenceGap { .. })
        ));
    }

    #[test]
    fn anchoring_still_enforces_book_invariants() {
        let mut book = OrderBook::new();
        reconcile_buffer(&mut book, &snap(0), &[]);
        let crossing = delta(41, 42, 40, vec![(101.5, 1.0)]);
        assert!(matches!(
            apply_anchoring(&mut book, &crossing),
            Err(FeedError::Invariant(_))
        ));
    }

    #[test]
    fn trade_dedup_is_at_most_once_with_bounded_memory() {
        let mut dedup = TradeDedup::new(3);
        assert!(dedup.insert("a"));
        assert!(!dedup.insert("a"));
        assert!(dedup.insert("b"));
        assert!(dedup.insert("c"));
        assert!(dedup.insert("d")); // evicts "a"
        assert!(dedup.insert("a")); // re-admitted after eviction window
        assert_eq!(dedup.order.len(), 3);
    }
}
