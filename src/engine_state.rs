// =============================================================================
// Central Engine State: the single hub tying the subsystems together
// =============================================================================
//
// All subsystems manage their own interior mutability; EngineState holds the
// Arcs and provides a unified serialisable snapshot for the read-only API
// and the WebSocket feed.
//
// Thread safety:
//   - AtomicU64 for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystem engines.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::EventBus;
use crate::config::SentinelConfig;
use crate::executor::txlog::TxRecord;
use crate::executor::AtomicExecutor;
use crate::ledger::{LedgerMetrics, PerformanceLedger};
use crate::market_data::book::{BookManager, BookSnapshot};
use crate::market_data::streams::BoundedQueue;
use crate::persistence::StateStore;
use crate::portfolio::{PortfolioManager, PortfolioPosition};
use crate::risk::{RiskGuardian, RiskStateSnapshot};
use crate::stats::StatEngine;
use crate::types::{now_ms, PairId};

/// Maximum number of recent errors to retain for the dashboard.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central engine state shared across all async tasks via `Arc<EngineState>`.
pub struct EngineState {
    /// Monotonically increasing version counter, incremented on meaningful
    /// mutations; the WebSocket feed uses it to detect staleness.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<SentinelConfig>>,
    pub books: Arc<BookManager>,
    pub stats: Arc<StatEngine>,
    pub portfolio: Arc<PortfolioManager>,
    pub risk: Arc<RiskGuardian>,
    pub ledger: Arc<PerformanceLedger>,
    pub bus: EventBus,
    pub store: Option<Arc<StateStore>>,

    /// Set during wiring, after the venue map exists.
    pub executor: RwLock<Option<Arc<AtomicExecutor>>>,

    /// Per-pair market-data queues, registered by the orchestrator so the
    /// snapshot can report back-pressure drops.
    pub snapshot_queues: RwLock<HashMap<PairId, Arc<BoundedQueue<BookSnapshot>>>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl EngineState {
    pub fn new(config: SentinelConfig, store: Option<Arc<StateStore>>) -> Self {
        let bus = EventBus::new(config.event_buffer);
        let config = Arc::new(RwLock::new(config));

        Self {
            state_version: AtomicU64::new(1),
            books: Arc::new(BookManager::new()),
            stats: Arc::new(StatEngine::new(config.clone())),
            portfolio: Arc::new(PortfolioManager::new(config.clone())),
            risk: Arc::new(RiskGuardian::new(config.clone(), bus.clone())),
            ledger: Arc::new(PerformanceLedger::new(store.clone())),
            bus,
            store,
            executor: RwLock::new(None),
            snapshot_queues: RwLock::new(HashMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
            config,
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record an error; the ring buffer keeps the newest entries.
    pub fn push_error(&self, message: impl Into<String>, code: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        let overflow = errors.len().saturating_sub(MAX_RECENT_ERRORS);
        if overflow > 0 {
            errors.drain(..overflow);
        }
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the full serialisable snapshot served by `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = now_ms();
        let config = self.config.read();

        let mut pairs = HashMap::new();
        for spec in &config.pairs {
            let pair = &spec.pair;
            let stats = self.stats.stats(pair).ok();
            let (spot_impact_bps, perp_impact_bps) = self
                .stats
                .expected_impact_bps(pair)
                .unwrap_or((0.0, 0.0));
            pairs.insert(
                pair.to_string(),
                PairSnapshot {
                    health: self.stats.health(pair, now).to_string(),
                    basis: self.stats.basis_now(pair),
                    mean: stats.map(|s| s.mean),
                    stddev: stats.map(|s| s.stddev),
                    z: stats.map(|s| s.z),
                    p95: stats.map(|s| s.p95),
                    p05: stats.map(|s| s.p05),
                    count: stats.map(|s| s.count).unwrap_or(0),
                    spot_impact_bps,
                    perp_impact_bps,
                },
            );
        }

        let dropped_snapshots: u64 = self
            .snapshot_queues
            .read()
            .values()
            .map(|q| q.dropped())
            .sum();

        let (in_flight_intents, recent_transitions) = {
            let executor = self.executor.read();
            match executor.as_ref() {
                Some(e) => (e.in_flight_count(), e.txlog().recent(50)),
                None => (0, Vec::new()),
            }
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now,
            uptime_s: self.start_time.elapsed().as_secs(),
            engine_mode: config.engine_mode.to_string(),
            nav: self.portfolio.nav(),
            delta_bps: self.portfolio.delta() * 10_000.0,
            margin_utilization: self.portfolio.margin_utilization(),
            pairs,
            positions: self.portfolio.positions(),
            risk: self.risk.state(),
            metrics: self.ledger.metrics(now),
            counters: Counters {
                dropped_snapshots,
                dropped_stale_books: self.stats.dropped_stale(),
                dropped_crossed_books: self.stats.dropped_crossed(),
                in_flight_intents,
                trades: self.ledger.trade_count(),
            },
            recent_transitions,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("version", &self.current_state_version())
            .field("uptime_s", &self.start_time.elapsed().as_secs())
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_s: u64,
    pub engine_mode: String,
    pub nav: f64,
    pub delta_bps: f64,
    pub margin_utilization: f64,
    pub pairs: HashMap<String, PairSnapshot>,
    pub positions: Vec<PortfolioPosition>,
    pub risk: RiskStateSnapshot,
    pub metrics: LedgerMetrics,
    pub counters: Counters,
    pub recent_transitions: Vec<TxRecord>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSnapshot {
    pub health: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basis: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stddev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p05: Option<f64>,
    pub count: usize,
    pub spot_impact_bps: f64,
    pub perp_impact_bps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    pub dropped_snapshots: u64,
    pub dropped_stale_books: u64,
    pub dropped_crossed_books: u64,
    pub in_flight_intents: usize,
    pub trades: usize,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serialises_without_market_data() {
        let state = EngineState::new(SentinelConfig::default(), None);
        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.counters.trades, 0);
        assert_eq!(snapshot.positions.len(), 0);
        // One registered pair with no samples yet: UNSAFE, no stats.
        let pair = snapshot.pairs.values().next().unwrap();
        assert_eq!(pair.health, "UNSAFE");
        assert!(pair.z.is_none());

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("state_version"));
    }

    #[test]
    fn error_ring_is_bounded() {
        let state = EngineState::new(SentinelConfig::default(), None);
        for i in 0..100 {
            state.push_error(format!("error {i}"), None);
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "error 99");
    }

    #[test]
    fn version_increments_on_mutation() {
        let state = EngineState::new(SentinelConfig::default(), None);
        let v0 = state.current_state_version();
        state.push_error("boom", Some("E42".into()));
        assert!(state.current_state_version() > v0);
    }
}
