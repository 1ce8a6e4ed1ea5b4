// =============================================================================
// Runtime Configuration: hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Sentinel engine.  Every tunable parameter
// lives here so the engine can be reconfigured at runtime without a restart;
// consumers take a cloned snapshot per tick and never observe a half-applied
// reload.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.  `validate()` runs once at startup and
// fails fast on nonsensical values.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{EngineMode, PairId, PairSpec};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_window_seconds() -> u64 {
    3600
}

fn default_depth_levels() -> usize {
    10
}

fn default_warmup_min() -> usize {
    30
}

fn default_staleness_budget_ms() -> u64 {
    2000
}

fn default_halt_staleness_ms() -> u64 {
    10_000
}

fn default_signal_period_ms() -> u64 {
    200
}

fn default_z_open() -> f64 {
    2.0
}

fn default_z_close() -> f64 {
    0.0
}

fn default_base_notional() -> f64 {
    2000.0
}

fn default_min_intent_notional() -> f64 {
    100.0
}

fn default_vacuum_threshold() -> f64 {
    0.005
}

fn default_vacuum_min_liq() -> f64 {
    1_000_000.0
}

fn default_vacuum_window_ms() -> u64 {
    10_000
}

fn default_vacuum_min_confidence() -> f64 {
    0.3
}

fn default_vacuum_max_hold_s() -> u64 {
    900
}

fn default_vacuum_target_basis() -> f64 {
    0.0
}

fn default_vacuum_convergence_bps() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_twap_threshold() -> f64 {
    5000.0
}

fn default_twap_clip_max() -> f64 {
    500.0
}

fn default_twap_interval_min_s() -> u64 {
    30
}

fn default_twap_interval_max_s() -> u64 {
    90
}

fn default_twap_abort_bps() -> f64 {
    20.0
}

fn default_delta_warn_bps() -> f64 {
    200.0
}

fn default_delta_block_bps() -> f64 {
    500.0
}

fn default_delta_tolerance_notional() -> f64 {
    50.0
}

fn default_dd_reduce_pct() -> f64 {
    5.0
}

fn default_dd_safe_pct() -> f64 {
    10.0
}

fn default_margin_tier1_pct() -> f64 {
    30.0
}

fn default_margin_compound_pct() -> f64 {
    5.0
}

fn default_margin_target_pct() -> f64 {
    20.0
}

fn default_core_allocation_pct() -> f64 {
    50.0
}

fn default_core_step_pct() -> f64 {
    10.0
}

fn default_satellite_allocation_pct() -> f64 {
    30.0
}

fn default_min_nav_floor() -> f64 {
    100.0
}

fn default_max_pair_notional() -> f64 {
    50_000.0
}

fn default_max_aggregate_notional() -> f64 {
    200_000.0
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_intent_ttl_ms() -> u64 {
    5000
}

fn default_dispatch_window_ms() -> u64 {
    100
}

fn default_cross_venue_margin_bps() -> f64 {
    5.0
}

fn default_aggression_bps() -> f64 {
    2.0
}

fn default_max_slippage_bps() -> f64 {
    25.0
}

fn default_unrealized_loss_review_pct() -> f64 {
    10.0
}

fn default_snapshot_channel_capacity() -> usize {
    64
}

fn default_event_buffer() -> usize {
    512
}

fn default_persist_interval_s() -> u64 {
    60
}

fn default_data_dir() -> String {
    "state".to_string()
}

fn default_pairs() -> Vec<PairSpec> {
    vec![PairSpec {
        pair: PairId::new("binance", "BTCUSDT"),
        spot_instrument: "BTCUSDT".to_string(),
        perp_instrument: "BTCUSDT".to_string(),
        tick_size: 0.1,
        lot_size: 0.0001,
        fee_maker_bps: 1.0,
        fee_taker_bps: 4.0,
        min_notional: 10.0,
    }]
}

// =============================================================================
// SentinelConfig
// =============================================================================

/// Top-level runtime configuration for the Sentinel engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    // --- Operational mode ----------------------------------------------------
    /// Paper (in-process simulated venue) or Live.
    #[serde(default)]
    pub engine_mode: EngineMode,

    /// Registered spot/perp pairs. Immutable after startup.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<PairSpec>,

    // --- Statistical engine --------------------------------------------------
    /// Rolling basis window duration in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Maximum book levels consumed by the depth-weighted walk.
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,

    /// Samples required before mean/stddev/z are reported.
    #[serde(default = "default_warmup_min")]
    pub warmup_min: usize,

    /// A book older than this is rejected at ingest.
    #[serde(default = "default_staleness_budget_ms")]
    pub staleness_budget_ms: u64,

    /// A pair whose books have been stale this long is marked UNSAFE.
    #[serde(default = "default_halt_staleness_ms")]
    pub halt_staleness_ms: u64,

    // --- Signal generator ----------------------------------------------------
    #[serde(default = "default_signal_period_ms")]
    pub signal_period_ms: u64,

    /// z-score at or above which a satellite hedge opens.
    #[serde(default = "default_z_open")]
    pub z_open: f64,

    /// z-score at or below which an open satellite closes.
    #[serde(default = "default_z_close")]
    pub z_close: f64,

    /// Baseline intent notional; also feeds the depth-walk budget
    /// (`base_notional / 4`).
    #[serde(default = "default_base_notional")]
    pub base_notional: f64,

    /// Intents below this notional are not worth their fees.
    #[serde(default = "default_min_intent_notional")]
    pub min_intent_notional: f64,

    /// Share of NAV kept in the standing core hedge.
    #[serde(default = "default_core_allocation_pct")]
    pub core_allocation_pct: f64,

    /// Fraction of the core gap corrected per signal tick.
    #[serde(default = "default_core_step_pct")]
    pub core_step_pct: f64,

    /// NAV share available to satellite positions.
    #[serde(default = "default_satellite_allocation_pct")]
    pub satellite_allocation_pct: f64,

    /// No opening intents below this NAV.
    #[serde(default = "default_min_nav_floor")]
    pub min_nav_floor: f64,

    // --- Vacuum detector -----------------------------------------------------
    /// Absolute basis beyond which a dislocation is considered vacuum-grade.
    #[serde(default = "default_vacuum_threshold")]
    pub vacuum_threshold: f64,

    /// Liquidations below this notional are ignored.
    #[serde(default = "default_vacuum_min_liq")]
    pub vacuum_min_liq: f64,

    /// Sliding correlation window for liquidation events.
    #[serde(default = "default_vacuum_window_ms")]
    pub vacuum_window_ms: u64,

    /// Minimum detection confidence before a vacuum intent is emitted.
    #[serde(default = "default_vacuum_min_confidence")]
    pub vacuum_min_confidence: f64,

    /// Maximum holding period of a vacuum position before forced close.
    #[serde(default = "default_vacuum_max_hold_s")]
    pub vacuum_max_hold_s: u64,

    /// Convergence target for vacuum positions.
    #[serde(default = "default_vacuum_target_basis")]
    pub vacuum_target_basis: f64,

    /// A vacuum position closes once the basis comes within this distance of
    /// its convergence target.
    #[serde(default = "default_vacuum_convergence_bps")]
    pub vacuum_convergence_bps: f64,

    /// Whether vacuum positions count toward the delta envelope.
    #[serde(default = "default_true")]
    pub vacuum_counts_toward_delta: bool,

    // --- Execution -----------------------------------------------------------
    /// Notional above which execution switches to TWAP slicing.
    #[serde(default = "default_twap_threshold")]
    pub twap_threshold: f64,

    /// Maximum notional per TWAP clip.
    #[serde(default = "default_twap_clip_max")]
    pub twap_clip_max: f64,

    #[serde(default = "default_twap_interval_min_s")]
    pub twap_interval_min_s: u64,

    #[serde(default = "default_twap_interval_max_s")]
    pub twap_interval_max_s: u64,

    /// A clip slipping beyond this aborts the remaining clips.
    #[serde(default = "default_twap_abort_bps")]
    pub twap_abort_bps: f64,

    /// Non-TWAP intent time-to-live.
    #[serde(default = "default_intent_ttl_ms")]
    pub intent_ttl_ms: u64,

    /// Target wall-clock window between the two leg placements.
    #[serde(default = "default_dispatch_window_ms")]
    pub dispatch_window_ms: u64,

    /// Price aggression applied to post-only limit legs.
    #[serde(default = "default_aggression_bps")]
    pub aggression_bps: f64,

    /// Default per-intent slippage budget.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,

    // --- Router --------------------------------------------------------------
    /// Minimum expected saving before a cross-venue split is preferred.
    #[serde(default = "default_cross_venue_margin_bps")]
    pub cross_venue_margin_bps: f64,

    // --- Risk ----------------------------------------------------------------
    #[serde(default = "default_delta_warn_bps")]
    pub delta_warn_bps: f64,

    #[serde(default = "default_delta_block_bps")]
    pub delta_block_bps: f64,

    /// Maximum tolerated filled-leg imbalance, in notional terms.
    #[serde(default = "default_delta_tolerance_notional")]
    pub delta_tolerance_notional: f64,

    /// Daily drawdown beyond which sizing is halved.
    #[serde(default = "default_dd_reduce_pct")]
    pub dd_reduce_pct: f64,

    /// Daily drawdown beyond which SAFE_MODE engages.
    #[serde(default = "default_dd_safe_pct")]
    pub dd_safe_pct: f64,

    #[serde(default = "default_max_pair_notional")]
    pub max_pair_notional: f64,

    #[serde(default = "default_max_aggregate_notional")]
    pub max_aggregate_notional: f64,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,

    /// Unrealized loss (pct of position notional) that raises a review flag.
    #[serde(default = "default_unrealized_loss_review_pct")]
    pub unrealized_loss_review_pct: f64,

    // --- Rebalancer ----------------------------------------------------------
    /// Margin utilization above which Tier-1 top-up runs.
    #[serde(default = "default_margin_tier1_pct")]
    pub margin_tier1_pct: f64,

    /// Margin utilization below which excess margin is compounded to spot.
    #[serde(default = "default_margin_compound_pct")]
    pub margin_compound_pct: f64,

    /// Utilization the rebalancer steers toward after a trigger.
    #[serde(default = "default_margin_target_pct")]
    pub margin_target_pct: f64,

    // --- Plumbing ------------------------------------------------------------
    #[serde(default = "default_snapshot_channel_capacity")]
    pub snapshot_channel_capacity: usize,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default = "default_persist_interval_s")]
    pub persist_interval_s: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialise")
    }
}

impl SentinelConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = config.pairs.len(),
            engine_mode = %config.engine_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Validate invariants between fields. Called once at startup; the engine
    /// refuses to start on any violation.
    pub fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            anyhow::bail!("config: at least one pair must be registered");
        }
        if self.z_open <= self.z_close {
            anyhow::bail!(
                "config: z_open ({}) must exceed z_close ({})",
                self.z_open,
                self.z_close
            );
        }
        if self.twap_interval_min_s > self.twap_interval_max_s {
            anyhow::bail!("config: twap_interval_min_s exceeds twap_interval_max_s");
        }
        if self.twap_clip_max <= 0.0 || self.twap_threshold <= 0.0 {
            anyhow::bail!("config: TWAP threshold and clip size must be positive");
        }
        if self.delta_warn_bps >= self.delta_block_bps {
            anyhow::bail!("config: delta_warn_bps must be below delta_block_bps");
        }
        if self.dd_reduce_pct >= self.dd_safe_pct {
            anyhow::bail!("config: dd_reduce_pct must be below dd_safe_pct");
        }
        if self.margin_compound_pct >= self.margin_tier1_pct {
            anyhow::bail!("config: margin_compound_pct must be below margin_tier1_pct");
        }
        if !(0.0..=100.0).contains(&self.core_allocation_pct)
            || !(0.0..=100.0).contains(&self.satellite_allocation_pct)
        {
            anyhow::bail!("config: allocation percentages must lie in [0, 100]");
        }
        if self.warmup_min == 0 || self.depth_levels == 0 {
            anyhow::bail!("config: warmup_min and depth_levels must be positive");
        }
        if self.staleness_budget_ms == 0 || self.staleness_budget_ms > self.halt_staleness_ms {
            anyhow::bail!("config: staleness_budget_ms must be positive and below halt_staleness_ms");
        }
        if self.max_leverage <= 0.0 {
            anyhow::bail!("config: max_leverage must be positive");
        }
        for spec in &self.pairs {
            if spec.min_notional < 0.0 || spec.tick_size < 0.0 || spec.lot_size < 0.0 {
                anyhow::bail!("config: pair {} has negative sizing fields", spec.pair);
            }
        }
        Ok(())
    }

    /// Rolling window duration in milliseconds.
    pub fn window_ms(&self) -> i64 {
        (self.window_seconds * 1000) as i64
    }

    /// Depth-walk notional budget derived from the baseline intent size.
    pub fn depth_notional_budget(&self) -> f64 {
        self.base_notional / 4.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = SentinelConfig::default();
        assert_eq!(cfg.window_seconds, 3600);
        assert_eq!(cfg.depth_levels, 10);
        assert_eq!(cfg.warmup_min, 30);
        assert_eq!(cfg.signal_period_ms, 200);
        assert!((cfg.z_open - 2.0).abs() < f64::EPSILON);
        assert!((cfg.z_close - 0.0).abs() < f64::EPSILON);
        assert!((cfg.vacuum_threshold - 0.005).abs() < f64::EPSILON);
        assert!((cfg.vacuum_min_liq - 1e6).abs() < f64::EPSILON);
        assert_eq!(cfg.vacuum_window_ms, 10_000);
        assert!((cfg.twap_threshold - 5000.0).abs() < f64::EPSILON);
        assert!((cfg.twap_clip_max - 500.0).abs() < f64::EPSILON);
        assert_eq!(cfg.twap_interval_min_s, 30);
        assert_eq!(cfg.twap_interval_max_s, 90);
        assert!((cfg.twap_abort_bps - 20.0).abs() < f64::EPSILON);
        assert!((cfg.delta_warn_bps - 200.0).abs() < f64::EPSILON);
        assert!((cfg.delta_block_bps - 500.0).abs() < f64::EPSILON);
        assert!((cfg.dd_reduce_pct - 5.0).abs() < f64::EPSILON);
        assert!((cfg.dd_safe_pct - 10.0).abs() < f64::EPSILON);
        assert!((cfg.margin_tier1_pct - 30.0).abs() < f64::EPSILON);
        assert!((cfg.margin_compound_pct - 5.0).abs() < f64::EPSILON);
        assert!((cfg.core_allocation_pct - 50.0).abs() < f64::EPSILON);
        assert!(cfg.vacuum_counts_toward_delta);
        assert_eq!(cfg.engine_mode, EngineMode::Paper);
        assert_eq!(cfg.pairs.len(), 1);
    }

    #[test]
    fn default_config_validates() {
        SentinelConfig::default().validate().unwrap();
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "z_open": 2.5, "window_seconds": 600 }"#;
        let cfg: SentinelConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.z_open - 2.5).abs() < f64::EPSILON);
        assert_eq!(cfg.window_seconds, 600);
        assert_eq!(cfg.warmup_min, 30);
        assert_eq!(cfg.vacuum_window_ms, 10_000);
    }

    #[test]
    fn validation_rejects_inverted_z_thresholds() {
        let mut cfg = SentinelConfig::default();
        cfg.z_open = -1.0;
        cfg.z_close = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_pairs() {
        let mut cfg = SentinelConfig::default();
        cfg.pairs.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_inverted_twap_intervals() {
        let mut cfg = SentinelConfig::default();
        cfg.twap_interval_min_s = 120;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = SentinelConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: SentinelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.window_seconds, cfg2.window_seconds);
        assert_eq!(cfg.pairs.len(), cfg2.pairs.len());
        assert_eq!(cfg.engine_mode, cfg2.engine_mode);
    }

    #[test]
    fn depth_budget_is_quarter_of_base_notional() {
        let cfg = SentinelConfig::default();
        assert!((cfg.depth_notional_budget() - cfg.base_notional / 4.0).abs() < 1e-9);
    }
}
