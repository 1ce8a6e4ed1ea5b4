// =============================================================================
// Statistical Engine: rolling basis statistics per pair
// =============================================================================
//
// Consumes paired spot/perp book snapshots, computes depth-weighted prices,
// and maintains per-pair rolling statistics of the basis using Welford's
// online algorithm for numerical stability. Percentile queries use a lazily
// rebuilt sorted buffer whose rebuild cost is amortized across evictions.
//
// Per-pair isolation is absolute: no statistic ever pools samples across
// pairs. Stale or crossed books are dropped with a counter increment and
// never halt the engine; a pair whose ingest has been silent beyond the halt
// budget is reported UNSAFE and its signals are suppressed upstream.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::config::SentinelConfig;
use crate::market_data::book::BookSnapshot;
use crate::types::{PairHealth, PairId, PairSpec};

/// Hard cap on retained samples per pair, independent of window duration.
const WINDOW_CAPACITY: usize = 100_000;

/// Signed basis as a ratio of the spot price.
pub fn basis_of(spot_dw: f64, perp_dw: f64) -> f64 {
    (perp_dw - spot_dw) / spot_dw
}

/// One basis observation produced by `ingest`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasisSample {
    pub pair: PairId,
    pub at_ms: i64,
    pub spot_dw: f64,
    pub perp_dw: f64,
    pub basis: f64,
}

/// Why an ingest attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestError {
    StaleBook,
    CrossedBook,
    EmptyBook,
    NonMonotonic,
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleBook => write!(f, "STALE_BOOK"),
            Self::CrossedBook => write!(f, "CROSSED_BOOK"),
            Self::EmptyBook => write!(f, "EMPTY_BOOK"),
            Self::NonMonotonic => write!(f, "NON_MONOTONIC"),
        }
    }
}

/// Reported when a window has not yet accumulated `warmup_min` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientSamples {
    pub have: usize,
    pub need: usize,
}

impl std::fmt::Display for InsufficientSamples {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "INSUFFICIENT_SAMPLES ({}/{})", self.have, self.need)
    }
}

/// Snapshot of a pair's rolling statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PairStats {
    pub mean: f64,
    pub stddev: f64,
    pub z: f64,
    pub p95: f64,
    pub p05: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub last: f64,
}

// =============================================================================
// Rolling window (Welford + age eviction + lazy percentiles)
// =============================================================================

struct RollingWindow {
    window_ms: i64,
    samples: VecDeque<(i64, f64)>,
    mean: f64,
    m2: f64,
    sorted: Vec<f64>,
    sorted_dirty: bool,
}

impl RollingWindow {
    fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
            mean: 0.0,
            m2: 0.0,
            sorted: Vec::new(),
            sorted_dirty: false,
        }
    }

    fn count(&self) -> usize {
        self.samples.len()
    }

    fn push(&mut self, at_ms: i64, value: f64) {
        self.evict_older_than(at_ms - self.window_ms);
        if self.samples.len() >= WINDOW_CAPACITY {
            self.pop_front();
        }

        // Welford accumulate.
        self.samples.push_back((at_ms, value));
        let n = self.samples.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
        self.sorted_dirty = true;
    }

    fn evict_older_than(&mut self, cutoff_ms: i64) {
        while let Some(&(t, _)) = self.samples.front() {
            if t < cutoff_ms {
                self.pop_front();
            } else {
                break;
            }
        }
    }

    fn pop_front(&mut self) {
        let Some((_, value)) = self.samples.pop_front() else {
            return;
        };
        let n = self.samples.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
        } else {
            // Welford removal: reverse the accumulation of `value`.
            let old_mean = self.mean;
            self.mean = ((n as f64 + 1.0) * old_mean - value) / n as f64;
            self.m2 -= (value - old_mean) * (value - self.mean);
            if self.m2 < 0.0 {
                self.m2 = 0.0;
            }
        }
        self.sorted_dirty = true;
    }

    fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        (self.m2 / (n as f64 - 1.0)).max(0.0).sqrt()
    }

    fn min(&self) -> f64 {
        self.samples
            .iter()
            .map(|&(_, v)| v)
            .fold(f64::INFINITY, f64::min)
    }

    fn max(&self) -> f64 {
        self.samples
            .iter()
            .map(|&(_, v)| v)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Nearest-rank percentile over the retained samples. Rebuilds the sorted
    /// buffer only when samples changed since the last query.
    fn percentile(&mut self, p: f64) -> f64 {
        if self.sorted_dirty {
            self.sorted.clear();
            self.sorted.extend(self.samples.iter().map(|&(_, v)| v));
            self.sorted
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted_dirty = false;
        }
        if self.sorted.is_empty() {
            return 0.0;
        }
        let rank = ((p / 100.0) * self.sorted.len() as f64).ceil() as usize;
        self.sorted[rank.clamp(1, self.sorted.len()) - 1]
    }
}

// =============================================================================
// StatEngine
// =============================================================================

struct PairWindow {
    window: RollingWindow,
    last_sample_ms: i64,
    last_basis: f64,
    /// Worst-side impact of the latest ingest, in basis points. Feeds the
    /// router's cost model.
    spot_impact_bps: f64,
    perp_impact_bps: f64,
}

pub struct StatEngine {
    config: Arc<RwLock<SentinelConfig>>,
    windows: RwLock<HashMap<PairId, PairWindow>>,
    dropped_stale: AtomicU64,
    dropped_crossed: AtomicU64,
}

impl StatEngine {
    pub fn new(config: Arc<RwLock<SentinelConfig>>) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            dropped_stale: AtomicU64::new(0),
            dropped_crossed: AtomicU64::new(0),
        }
    }

    /// Ingest a paired snapshot update and produce a `BasisSample`.
    ///
    /// Rejections increment drop counters and never halt the engine.
    pub fn ingest(
        &self,
        spec: &PairSpec,
        spot: &BookSnapshot,
        perp: &BookSnapshot,
        now_ms: i64,
    ) -> Result<BasisSample, IngestError> {
        let (staleness_ms, depth_levels, budget, window_ms) = {
            let cfg = self.config.read();
            (
                cfg.staleness_budget_ms,
                cfg.depth_levels,
                cfg.depth_notional_budget(),
                cfg.window_ms(),
            )
        };

        if spot.is_stale(now_ms, staleness_ms) || perp.is_stale(now_ms, staleness_ms) {
            self.dropped_stale.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::StaleBook);
        }
        if spot.is_crossed() || perp.is_crossed() {
            self.dropped_crossed.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::CrossedBook);
        }

        let (spot_dw, spot_impact) = spot
            .depth_weighted_mid(depth_levels, budget)
            .ok_or(IngestError::EmptyBook)?;
        let (perp_dw, perp_impact) = perp
            .depth_weighted_mid(depth_levels, budget)
            .ok_or(IngestError::EmptyBook)?;
        if spot_dw <= 0.0 {
            return Err(IngestError::EmptyBook);
        }

        let at_ms = spot.at_ms.max(perp.at_ms);
        let basis = basis_of(spot_dw, perp_dw);

        let mut windows = self.windows.write();
        let entry = windows
            .entry(spec.pair.clone())
            .or_insert_with(|| PairWindow {
                window: RollingWindow::new(window_ms),
                last_sample_ms: i64::MIN,
                last_basis: 0.0,
                spot_impact_bps: 0.0,
                perp_impact_bps: 0.0,
            });

        // Per-pair timestamps are strictly monotonic.
        if at_ms <= entry.last_sample_ms {
            return Err(IngestError::NonMonotonic);
        }

        entry.window.push(at_ms, basis);
        entry.last_sample_ms = at_ms;
        entry.last_basis = basis;
        entry.spot_impact_bps = spot_impact * 10_000.0;
        entry.perp_impact_bps = perp_impact * 10_000.0;

        debug!(
            pair = %spec.pair,
            basis,
            spot_dw,
            perp_dw,
            count = entry.window.count(),
            "basis sample ingested"
        );

        Ok(BasisSample {
            pair: spec.pair.clone(),
            at_ms,
            spot_dw,
            perp_dw,
            basis,
        })
    }

    /// Rolling statistics for a pair; `Err` until warmed up.
    pub fn stats(&self, pair: &PairId) -> Result<PairStats, InsufficientSamples> {
        let warmup = self.config.read().warmup_min;
        let mut windows = self.windows.write();
        let entry = windows.get_mut(pair).ok_or(InsufficientSamples {
            have: 0,
            need: warmup,
        })?;

        let count = entry.window.count();
        if count < warmup {
            return Err(InsufficientSamples {
                have: count,
                need: warmup,
            });
        }

        let mean = entry.window.mean;
        let stddev = entry.window.stddev();
        let last = entry.last_basis;
        let z = if stddev > 0.0 {
            (last - mean) / stddev
        } else {
            0.0
        };

        Ok(PairStats {
            mean,
            stddev,
            z,
            p95: entry.window.percentile(95.0),
            p05: entry.window.percentile(5.0),
            min: entry.window.min(),
            max: entry.window.max(),
            count,
            last,
        })
    }

    /// Latest observed basis, if the pair has ever ingested.
    pub fn basis_now(&self, pair: &PairId) -> Option<f64> {
        self.windows.read().get(pair).map(|w| w.last_basis)
    }

    /// Worst-side expected impact (bps) of the latest ingest per market half.
    pub fn expected_impact_bps(&self, pair: &PairId) -> Option<(f64, f64)> {
        self.windows
            .read()
            .get(pair)
            .map(|w| (w.spot_impact_bps, w.perp_impact_bps))
    }

    /// A pair whose ingest has been silent beyond the halt budget is UNSAFE.
    pub fn health(&self, pair: &PairId, now_ms: i64) -> PairHealth {
        let halt_ms = self.config.read().halt_staleness_ms as i64;
        match self.windows.read().get(pair) {
            Some(w) if now_ms - w.last_sample_ms <= halt_ms => PairHealth::Fresh,
            _ => PairHealth::Unsafe,
        }
    }

    pub fn dropped_stale(&self) -> u64 {
        self.dropped_stale.load(Ordering::Relaxed)
    }

    pub fn dropped_crossed(&self) -> u64 {
        self.dropped_crossed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for StatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatEngine")
            .field("pairs", &self.windows.read().len())
            .field("dropped_stale", &self.dropped_stale())
            .field("dropped_crossed", &self.dropped_crossed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::book::BookLevel;
    use crate::types::MarketKind;

    fn test_config() -> Arc<RwLock<SentinelConfig>> {
        Arc::new(RwLock::new(SentinelConfig::default()))
    }

    fn spec_for(symbol: &str) -> PairSpec {
        PairSpec {
            pair: PairId::new("binance", symbol),
            spot_instrument: symbol.to_string(),
            perp_instrument: symbol.to_string(),
            tick_size: 0.01,
            lot_size: 0.0001,
            fee_maker_bps: 1.0,
            fee_taker_bps: 4.0,
            min_notional: 10.0,
        }
    }

    fn book(market: MarketKind, mid: f64, seq: u64, at_ms: i64) -> BookSnapshot {
        BookSnapshot {
            venue: "binance".into(),
            symbol: "BTCUSDT".into(),
            market,
            bids: vec![BookLevel {
                price: mid - 0.5,
                size: 100.0,
            }],
            asks: vec![BookLevel {
                price: mid + 0.5,
                size: 100.0,
            }],
            seq,
            at_ms,
        }
    }

    fn ingest_mid(
        engine: &StatEngine,
        spec: &PairSpec,
        spot_mid: f64,
        perp_mid: f64,
        at_ms: i64,
    ) -> Result<BasisSample, IngestError> {
        let spot = book(MarketKind::Spot, spot_mid, at_ms as u64, at_ms);
        let perp = book(MarketKind::Perp, perp_mid, at_ms as u64, at_ms);
        engine.ingest(spec, &spot, &perp, at_ms)
    }

    /// Basis sign convention: basis > 0 iff perp_dw > spot_dw, over 10 000
    /// randomized trials.
    #[test]
    fn basis_sign_convention_randomized() {
        let mut state = 0x9e3779b97f4a7c15u64;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 1_000_000) as f64 / 100.0 + 1.0
        };

        for _ in 0..10_000 {
            let spot = next();
            let perp = next();
            let basis = basis_of(spot, perp);
            if perp > spot {
                assert!(basis > 0.0, "perp {perp} > spot {spot} but basis {basis} <= 0");
            } else if perp < spot {
                assert!(basis < 0.0, "perp {perp} < spot {spot} but basis {basis} >= 0");
            } else {
                assert!(basis.abs() < 1e-15);
            }
        }
    }

    /// Reported z equals (current - mean) / stddev over retained samples
    /// within 1e-9, cross-checked against a naive two-pass computation.
    #[test]
    fn z_matches_naive_computation() {
        let engine = StatEngine::new(test_config());
        let spec = spec_for("BTCUSDT");

        let mut naive: Vec<f64> = Vec::new();
        let mut t = 1_000;
        let mut state = 42u64;
        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let bump = ((state % 2000) as f64 - 1000.0) / 10_000.0;
            let spot = 100.0;
            let perp = 100.0 + bump;
            let sample = ingest_mid(&engine, &spec, spot, perp, t).unwrap();
            naive.push(sample.basis);
            t += 200;
        }

        let stats = engine.stats(&spec.pair).unwrap();
        let n = naive.len() as f64;
        let mean: f64 = naive.iter().sum::<f64>() / n;
        let var: f64 = naive.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let stddev = var.sqrt();
        let z = (naive.last().unwrap() - mean) / stddev;

        assert!((stats.mean - mean).abs() < 1e-9, "mean drifted");
        assert!((stats.stddev - stddev).abs() < 1e-9, "stddev drifted");
        assert!((stats.z - z).abs() < 1e-9, "z drifted");
        assert!(stats.stddev >= 0.0);
    }

    /// Mutating pair A's samples never affects pair B's stats.
    #[test]
    fn per_pair_isolation() {
        let engine = StatEngine::new(test_config());
        let a = spec_for("BTCUSDT");
        let b = spec_for("ETHUSDT");

        let mut t = 1_000;
        for i in 0..60 {
            let wiggle = if i % 2 == 0 { 0.05 } else { -0.05 };
            ingest_mid(&engine, &a, 100.0, 100.0 + wiggle, t).unwrap();
            ingest_mid(&engine, &b, 50.0, 50.0 + wiggle / 2.0, t).unwrap();
            t += 200;
        }
        let before = engine.stats(&b.pair).unwrap();

        // Pound pair A with an extreme dislocation.
        for _ in 0..100 {
            ingest_mid(&engine, &a, 100.0, 150.0, t).unwrap();
            t += 200;
        }
        let after = engine.stats(&b.pair).unwrap();

        assert_eq!(before.count, after.count);
        assert!((before.mean - after.mean).abs() < 1e-15);
        assert!((before.stddev - after.stddev).abs() < 1e-15);
        assert!((before.z - after.z).abs() < 1e-15);
    }

    #[test]
    fn warmup_boundary() {
        let engine = StatEngine::new(test_config());
        let spec = spec_for("BTCUSDT");

        let mut t = 1_000;
        for _ in 0..29 {
            ingest_mid(&engine, &spec, 100.0, 100.05, t).unwrap();
            t += 200;
        }
        let err = engine.stats(&spec.pair).unwrap_err();
        assert_eq!(err.have, 29);
        assert_eq!(err.need, 30);

        ingest_mid(&engine, &spec, 100.0, 100.1, t).unwrap();
        assert!(engine.stats(&spec.pair).is_ok());
    }

    #[test]
    fn stale_and_crossed_books_are_counted_not_fatal() {
        let engine = StatEngine::new(test_config());
        let spec = spec_for("BTCUSDT");

        // Stale: book stamped 10s before "now".
        let spot = book(MarketKind::Spot, 100.0, 1, 0);
        let perp = book(MarketKind::Perp, 100.0, 1, 0);
        assert_eq!(
            engine.ingest(&spec, &spot, &perp, 10_000),
            Err(IngestError::StaleBook)
        );
        assert_eq!(engine.dropped_stale(), 1);

        // Crossed: bid above ask.
        let mut crossed = book(MarketKind::Spot, 100.0, 2, 10_000);
        crossed.bids[0].price = crossed.asks[0].price + 1.0;
        let perp = book(MarketKind::Perp, 100.0, 2, 10_000);
        assert_eq!(
            engine.ingest(&spec, &crossed, &perp, 10_000),
            Err(IngestError::CrossedBook)
        );
        assert_eq!(engine.dropped_crossed(), 1);

        // Engine still ingests fine afterwards.
        assert!(ingest_mid(&engine, &spec, 100.0, 100.05, 10_001).is_ok());
    }

    #[test]
    fn non_monotonic_timestamps_rejected() {
        let engine = StatEngine::new(test_config());
        let spec = spec_for("BTCUSDT");
        ingest_mid(&engine, &spec, 100.0, 100.05, 5_000).unwrap();
        assert_eq!(
            ingest_mid(&engine, &spec, 100.0, 100.05, 5_000),
            Err(IngestError::NonMonotonic)
        );
        assert_eq!(
            ingest_mid(&engine, &spec, 100.0, 100.05, 4_000),
            Err(IngestError::NonMonotonic)
        );
    }

    #[test]
    fn window_evicts_by_age() {
        let config = test_config();
        config.write().window_seconds = 10; // 10s window for the test
        config.write().warmup_min = 2;
        let engine = StatEngine::new(config);
        let spec = spec_for("BTCUSDT");

        ingest_mid(&engine, &spec, 100.0, 100.2, 1_000).unwrap();
        for i in 1..=5 {
            ingest_mid(&engine, &spec, 100.0, 100.05, 1_000 + i * 200).unwrap();
        }
        assert_eq!(engine.stats(&spec.pair).unwrap().count, 6);

        // 30s later, everything prior has aged out; only the new sample and
        // anything within 10s remains.
        ingest_mid(&engine, &spec, 100.0, 100.05, 31_000).unwrap();
        ingest_mid(&engine, &spec, 100.0, 100.05, 31_200).unwrap();
        assert_eq!(engine.stats(&spec.pair).unwrap().count, 2);
    }

    #[test]
    fn percentiles_order_and_bounds() {
        let config = test_config();
        config.write().warmup_min = 10;
        let engine = StatEngine::new(config);
        let spec = spec_for("BTCUSDT");

        let mut t = 1_000;
        for i in 0..100 {
            // Linearly rising basis from 0 to ~0.99 bps steps.
            let perp = 100.0 + i as f64 * 0.001;
            ingest_mid(&engine, &spec, 100.0, perp, t).unwrap();
            t += 200;
        }
        let stats = engine.stats(&spec.pair).unwrap();
        assert!(stats.p05 < stats.p95);
        assert!(stats.p05 >= stats.min - 1e-15);
        assert!(stats.p95 <= stats.max + 1e-15);
    }

    #[test]
    fn health_tracks_ingest_silence() {
        let engine = StatEngine::new(test_config());
        let spec = spec_for("BTCUSDT");

        assert_eq!(engine.health(&spec.pair, 0), PairHealth::Unsafe);
        ingest_mid(&engine, &spec, 100.0, 100.05, 1_000).unwrap();
        assert_eq!(engine.health(&spec.pair, 2_000), PairHealth::Fresh);
        // Silent past the 10s halt budget.
        assert_eq!(engine.health(&spec.pair, 12_000), PairHealth::Unsafe);
    }

    /// Scenario: 300 settled samples then a +25 bps dislocation produces a
    /// z-score in the satellite-open region.
    #[test]
    fn dislocation_produces_open_grade_z() {
        let engine = StatEngine::new(test_config());
        let spec = spec_for("BTCUSDT");

        let mut t = 1_000;
        for i in 0..300 {
            // Alternate +-1 bp around flat so mean ~ 0, stddev ~ 0.001.
            let wiggle = if i % 2 == 0 { 0.1 } else { -0.1 };
            ingest_mid(&engine, &spec, 100.0, 100.0 + wiggle, t).unwrap();
            t += 200;
        }
        ingest_mid(&engine, &spec, 100.0, 100.25, t).unwrap();

        let stats = engine.stats(&spec.pair).unwrap();
        assert!(
            stats.z > 2.0 && stats.z < 3.0,
            "expected open-grade z, got {}",
            stats.z
        );
    }
}
