// =============================================================================
// Snapshot plumbing: bounded drop-oldest queues and per-pair pump tasks
// =============================================================================
//
// Market-data producers must never block. Each (venue, symbol, market) stream
// feeds a bounded queue; when the consumer falls behind, the OLDEST snapshot
// is dropped and a counter increments. The statistics task drains the queue
// and only ever sees snapshots in venue-sequence order.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

use crate::market_data::book::{BookManager, BookSnapshot};
use crate::stats::StatEngine;
use crate::types::{MarketKind, PairSpec};
use crate::venue::VenueAdapter;

/// Bounded multi-writer queue with a drop-oldest overflow policy.
///
/// `push` never blocks: at capacity the front element is evicted and the
/// dropped counter incremented. `recv` awaits the next element.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an element, evicting the oldest when full.
    pub fn push(&self, item: T) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Await the next element.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(item) = self.inner.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total elements evicted due to back-pressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Pump tasks
// =============================================================================

/// Forward one venue book stream into a pair's bounded snapshot queue,
/// reconnecting with a delay on stream failure. Runs until shutdown flips.
pub async fn run_book_pump(
    adapter: Arc<dyn VenueAdapter>,
    spec: PairSpec,
    market: MarketKind,
    queue: Arc<BoundedQueue<BookSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let instrument = spec.instrument(market).to_string();
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut rx: mpsc::Receiver<BookSnapshot> =
            match adapter.subscribe_book(&instrument, market).await {
                Ok(rx) => rx,
                Err(e) => {
                    error!(
                        pair = %spec.pair,
                        market = %market,
                        error = %e,
                        "book subscription failed, retrying in 5s"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };

        info!(pair = %spec.pair, market = %market, "book stream connected");

        loop {
            tokio::select! {
                maybe_snapshot = rx.recv() => {
                    match maybe_snapshot {
                        Some(mut snapshot) => {
                            // Normalize to pair-level identity: adapters tag
                            // snapshots with their own instrument ids.
                            snapshot.venue = spec.pair.venue.clone();
                            snapshot.symbol = spec.pair.symbol.clone();
                            snapshot.market = market;
                            queue.push(snapshot);
                        }
                        None => {
                            warn!(pair = %spec.pair, market = %market, "book stream ended, reconnecting");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

/// Drain a pair's snapshot queue, maintain the book store, and feed the
/// statistical engine whenever both halves of the pair are present. The
/// portfolio's marks follow every accepted sample.
///
/// This is the single consumer of the pair's queue, so snapshot application
/// is strictly in-order.
pub async fn run_pair_stats_task(
    spec: PairSpec,
    queue: Arc<BoundedQueue<BookSnapshot>>,
    books: Arc<BookManager>,
    stats: Arc<StatEngine>,
    portfolio: Arc<crate::portfolio::PortfolioManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let snapshot = tokio::select! {
            snapshot = queue.recv() => snapshot,
            _ = shutdown.changed() => return,
        };

        if !books.update(&spec.pair, snapshot) {
            continue;
        }

        let (Some(spot), Some(perp)) = (
            books.get(&spec.pair, MarketKind::Spot),
            books.get(&spec.pair, MarketKind::Perp),
        ) else {
            continue;
        };

        // Ingest errors are counted inside the engine; nothing to do here.
        if let Ok(sample) = stats.ingest(&spec, &spot, &perp, crate::types::now_ms()) {
            portfolio.update_marks(&spec.pair, sample.spot_dw, sample.perp_dw);
        }
    }
}
