// =============================================================================
// Order books: snapshots, depth-weighted pricing, per-pair book store
// =============================================================================
//
// Depth-weighted prices are used instead of top-of-book because signals drive
// orders at size; a naive mid systematically under-estimates the executable
// basis.  The walk consumes levels until either `max_levels` are used or the
// cumulative notional reaches the budget, whichever comes first.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{MarketKind, PairId, Side};

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Bounded order-book snapshot for one market half of a pair.
///
/// `bids` are sorted best (highest) first, `asks` best (lowest) first.
/// `seq` is venue-monotonic per (venue, symbol, market).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub venue: String,
    pub symbol: String,
    pub market: MarketKind,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub seq: u64,
    pub at_ms: i64,
}

/// Result of a depth-weighted walk down one side of a book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthWeighted {
    /// Size-weighted average price of the consumed levels.
    pub price: f64,
    /// Total notional consumed by the walk.
    pub notional: f64,
    pub levels_used: usize,
    /// `|weighted - best| / best`, the expected impact of executing at size.
    pub impact: f64,
}

/// Walk `levels` accumulating `price * size` until the cumulative notional
/// reaches `notional_budget` or `max_levels` levels are consumed.
///
/// Returns `None` for an empty book or a non-positive best price.
pub fn depth_weighted(
    levels: &[BookLevel],
    max_levels: usize,
    notional_budget: f64,
) -> Option<DepthWeighted> {
    let best = levels.first()?.price;
    if best <= 0.0 {
        return None;
    }

    let mut sum_pq = 0.0;
    let mut sum_q = 0.0;
    let mut used = 0;

    for level in levels.iter().take(max_levels.max(1)) {
        if level.size <= 0.0 || level.price <= 0.0 {
            continue;
        }
        sum_pq += level.price * level.size;
        sum_q += level.size;
        used += 1;
        if sum_pq >= notional_budget {
            break;
        }
    }

    if sum_q <= 0.0 {
        return None;
    }

    let price = sum_pq / sum_q;
    Some(DepthWeighted {
        price,
        notional: sum_pq,
        levels_used: used,
        impact: (price - best).abs() / best,
    })
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Top-of-book mid, if both sides are present.
    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// A crossed book (`best_bid >= best_ask`) signals a feed glitch and is
    /// never usable for pricing.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.at_ms).max(0)
    }

    pub fn is_stale(&self, now_ms: i64, budget_ms: u64) -> bool {
        self.age_ms(now_ms) >= budget_ms as i64
    }

    /// Depth-weighted walk on the side an aggressor of `side` would consume:
    /// buys walk asks, sells walk bids.
    pub fn depth_weighted_for(
        &self,
        side: Side,
        max_levels: usize,
        notional_budget: f64,
    ) -> Option<DepthWeighted> {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        depth_weighted(levels, max_levels, notional_budget)
    }

    /// Depth-weighted mid and the worse of the two sides' impact.
    pub fn depth_weighted_mid(
        &self,
        max_levels: usize,
        notional_budget: f64,
    ) -> Option<(f64, f64)> {
        let bid = depth_weighted(&self.bids, max_levels, notional_budget)?;
        let ask = depth_weighted(&self.asks, max_levels, notional_budget)?;
        Some(((bid.price + ask.price) / 2.0, bid.impact.max(ask.impact)))
    }

    /// Available notional across both sides relative to `notional`, capped at
    /// 1.0. Feeds the signal generator's tie-break ranking.
    pub fn depth_ratio(&self, notional: f64) -> f64 {
        if notional <= 0.0 {
            return 1.0;
        }
        let total: f64 = self
            .bids
            .iter()
            .chain(self.asks.iter())
            .map(|l| l.price * l.size)
            .sum();
        (total / (2.0 * notional)).min(1.0)
    }
}

// =============================================================================
// BookManager
// =============================================================================

/// Stores the latest snapshot per (pair, market half), enforcing per-key
/// sequence monotonicity.
pub struct BookManager {
    books: RwLock<HashMap<(PairId, MarketKind), BookSnapshot>>,
}

impl BookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a snapshot. Returns `false` (and keeps the stored snapshot)
    /// when `seq` does not advance, which preserves strict in-order
    /// processing per (venue, symbol).
    pub fn update(&self, pair: &PairId, snapshot: BookSnapshot) -> bool {
        let key = (pair.clone(), snapshot.market);
        let mut books = self.books.write();
        if let Some(existing) = books.get(&key) {
            if snapshot.seq <= existing.seq {
                debug!(
                    pair = %pair,
                    market = %snapshot.market,
                    seq = snapshot.seq,
                    stored_seq = existing.seq,
                    "dropping out-of-order book snapshot"
                );
                return false;
            }
        }
        books.insert(key, snapshot);
        true
    }

    pub fn get(&self, pair: &PairId, market: MarketKind) -> Option<BookSnapshot> {
        self.books.read().get(&(pair.clone(), market)).cloned()
    }

    /// Timestamp of the older of the two halves, i.e. the pair is only as
    /// fresh as its most lagging book.
    pub fn pair_last_update_ms(&self, pair: &PairId) -> Option<i64> {
        let books = self.books.read();
        let spot = books.get(&(pair.clone(), MarketKind::Spot))?;
        let perp = books.get(&(pair.clone(), MarketKind::Perp))?;
        Some(spot.at_ms.min(perp.at_ms))
    }

    pub fn tracked_pairs(&self) -> Vec<PairId> {
        let mut pairs: Vec<PairId> = self.books.read().keys().map(|(p, _)| p.clone()).collect();
        pairs.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        pairs.dedup();
        pairs
    }
}

impl Default for BookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookManager")
            .field("tracked", &self.books.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn levels(pairs: &[(f64, f64)]) -> Vec<BookLevel> {
        pairs
            .iter()
            .map(|&(price, size)| BookLevel { price, size })
            .collect()
    }

    fn snapshot(bids: &[(f64, f64)], asks: &[(f64, f64)], seq: u64, at_ms: i64) -> BookSnapshot {
        BookSnapshot {
            venue: "binance".into(),
            symbol: "BTCUSDT".into(),
            market: MarketKind::Spot,
            bids: levels(bids),
            asks: levels(asks),
            seq,
            at_ms,
        }
    }

    #[test]
    fn depth_weighted_single_level_is_that_price() {
        let dw = depth_weighted(&levels(&[(100.0, 5.0)]), 10, 1e9).unwrap();
        assert!((dw.price - 100.0).abs() < 1e-12);
        assert_eq!(dw.levels_used, 1);
        assert!(dw.impact.abs() < 1e-12);
    }

    #[test]
    fn depth_weighted_stops_at_notional_budget() {
        // First level alone is 1000 notional, which already covers the budget.
        let lv = levels(&[(100.0, 10.0), (101.0, 10.0), (102.0, 10.0)]);
        let dw = depth_weighted(&lv, 10, 500.0).unwrap();
        assert_eq!(dw.levels_used, 1);
        assert!((dw.price - 100.0).abs() < 1e-12);
    }

    #[test]
    fn depth_weighted_stops_at_level_cap() {
        let lv = levels(&[(100.0, 1.0), (101.0, 1.0), (102.0, 1.0)]);
        let dw = depth_weighted(&lv, 2, 1e9).unwrap();
        assert_eq!(dw.levels_used, 2);
        let expected = (100.0 + 101.0) / 2.0;
        assert!((dw.price - expected).abs() < 1e-12);
    }

    /// For any non-empty book the weighted price lies between the best level
    /// and the worst level consumed, inclusive.
    #[test]
    fn depth_weighted_price_bounded_by_consumed_levels() {
        let mut state = 123456789u64;
        let mut next = || {
            // xorshift keeps the test free of extra dependencies
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 10_000) as f64 / 100.0 + 1.0
        };

        for _ in 0..2000 {
            let base = next();
            let n = (next() as usize % 8) + 1;
            let lv: Vec<BookLevel> = (0..n)
                .map(|i| BookLevel {
                    price: base + i as f64 * 0.5,
                    size: next(),
                })
                .collect();

            let budget = next() * 50.0;
            let dw = depth_weighted(&lv, 10, budget).unwrap();
            let worst = lv[dw.levels_used - 1].price;
            assert!(
                dw.price >= base - 1e-9 && dw.price <= worst + 1e-9,
                "weighted {} outside [{}, {}]",
                dw.price,
                base,
                worst
            );
        }
    }

    #[test]
    fn crossed_book_detection() {
        let healthy = snapshot(&[(99.0, 1.0)], &[(100.0, 1.0)], 1, 0);
        assert!(!healthy.is_crossed());
        let crossed = snapshot(&[(101.0, 1.0)], &[(100.0, 1.0)], 1, 0);
        assert!(crossed.is_crossed());
    }

    #[test]
    fn staleness_budget() {
        let snap = snapshot(&[(99.0, 1.0)], &[(100.0, 1.0)], 1, 1000);
        assert!(!snap.is_stale(2000, 2000));
        assert!(snap.is_stale(3000, 2000));
    }

    #[test]
    fn manager_rejects_seq_regression() {
        let mgr = BookManager::new();
        let pair = PairId::new("binance", "BTCUSDT");
        assert!(mgr.update(&pair, snapshot(&[(99.0, 1.0)], &[(100.0, 1.0)], 5, 0)));
        assert!(!mgr.update(&pair, snapshot(&[(98.0, 1.0)], &[(99.0, 1.0)], 5, 1)));
        assert!(!mgr.update(&pair, snapshot(&[(98.0, 1.0)], &[(99.0, 1.0)], 4, 2)));
        assert_eq!(mgr.get(&pair, MarketKind::Spot).unwrap().seq, 5);
        assert!(mgr.update(&pair, snapshot(&[(98.0, 1.0)], &[(99.0, 1.0)], 6, 3)));
    }

    #[test]
    fn pair_freshness_is_min_of_both_halves() {
        let mgr = BookManager::new();
        let pair = PairId::new("binance", "BTCUSDT");
        let mut spot = snapshot(&[(99.0, 1.0)], &[(100.0, 1.0)], 1, 1000);
        spot.market = MarketKind::Spot;
        let mut perp = snapshot(&[(99.5, 1.0)], &[(100.5, 1.0)], 1, 5000);
        perp.market = MarketKind::Perp;
        mgr.update(&pair, spot);
        assert!(mgr.pair_last_update_ms(&pair).is_none());
        mgr.update(&pair, perp);
        assert_eq!(mgr.pair_last_update_ms(&pair), Some(1000));
    }

    #[test]
    fn depth_ratio_caps_at_one() {
        let snap = snapshot(&[(100.0, 100.0)], &[(101.0, 100.0)], 1, 0);
        assert!((snap.depth_ratio(100.0) - 1.0).abs() < 1e-12);
        assert!(snap.depth_ratio(1e9) < 1.0);
    }
}
