// =============================================================================
// Risk Guardian: pre-trade gates, drawdown tiers, SAFE_MODE
// =============================================================================
//
// The guardian sits synchronously inside the executor's submit path (the
// pre-trade gate) and asynchronously behind a periodic monitor tick that
// recomputes NAV, tracks daily drawdown tiers, checks the delta envelope,
// and review-flags losing positions.
//
// Drawdown tiers: beyond dd_reduce_pct, sizing is halved; beyond dd_safe_pct
// the engine enters SAFE_MODE (no new opens; closes and rebalancing remain
// allowed). SAFE_MODE exits only after the drawdown stays below the reduce
// tier across a daily roll. Daily counters reset when the UTC date changes,
// mirroring the drawdown base to the day's starting NAV.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{EngineEvent, EventBus};
use crate::config::SentinelConfig;
use crate::executor::intent::Intent;
use crate::portfolio::PortfolioManager;

/// Structured refusal reason returned by the pre-trade gate.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVeto {
    SafeMode { drawdown_pct: f64 },
    NavFloor { nav: f64, floor: f64 },
    DeltaBlock { delta_bps: f64, block_bps: f64 },
    PairCap { pair_notional: f64, cap: f64 },
    AggregateCap { aggregate: f64, cap: f64 },
    LeverageCap { utilization: f64 },
    InvariantBreach { detail: String },
}

impl std::fmt::Display for RiskVeto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SafeMode { drawdown_pct } => {
                write!(f, "SAFE_MODE (drawdown {drawdown_pct:.2}%)")
            }
            Self::NavFloor { nav, floor } => {
                write!(f, "NAV {nav:.2} below floor {floor:.2}")
            }
            Self::DeltaBlock {
                delta_bps,
                block_bps,
            } => write!(f, "delta {delta_bps:.0}bps beyond block {block_bps:.0}bps"),
            Self::PairCap { pair_notional, cap } => {
                write!(f, "pair notional {pair_notional:.0} would exceed cap {cap:.0}")
            }
            Self::AggregateCap { aggregate, cap } => {
                write!(f, "aggregate notional {aggregate:.0} would exceed cap {cap:.0}")
            }
            Self::LeverageCap { utilization } => {
                write!(f, "margin utilization {utilization:.2} at leverage cap")
            }
            Self::InvariantBreach { detail } => write!(f, "invariant breach: {detail}"),
        }
    }
}

/// Serialisable snapshot of the risk state for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStateSnapshot {
    pub safe_mode: bool,
    pub size_multiplier: f64,
    pub day_start_nav: f64,
    pub peak_nav: f64,
    pub drawdown_pct: f64,
    pub invariant_breach: Option<String>,
    pub current_date: String,
}

/// Result of one monitor tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorOutcome {
    /// SAFE_MODE engaged on this tick; the caller must flatten.
    pub entered_safe_mode: bool,
}

struct Inner {
    current_date: String,
    day_start_nav: f64,
    peak_nav: f64,
    drawdown_pct: f64,
    max_drawdown_today: f64,
    reduce_tier_active: bool,
    safe_mode: bool,
    invariant_breach: Option<String>,
    flagged_positions: HashSet<String>,
}

pub struct RiskGuardian {
    config: Arc<RwLock<SentinelConfig>>,
    bus: EventBus,
    state: RwLock<Inner>,
}

impl RiskGuardian {
    pub fn new(config: Arc<RwLock<SentinelConfig>>, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            state: RwLock::new(Inner {
                current_date: Utc::now().format("%Y-%m-%d").to_string(),
                day_start_nav: 0.0,
                peak_nav: 0.0,
                drawdown_pct: 0.0,
                max_drawdown_today: 0.0,
                reduce_tier_active: false,
                safe_mode: false,
                invariant_breach: None,
                flagged_positions: HashSet::new(),
            }),
        }
    }

    /// Seed the drawdown base with the starting NAV.
    pub fn seed_nav(&self, nav: f64) {
        let mut s = self.state.write();
        s.day_start_nav = nav;
        s.peak_nav = nav;
        info!(nav, "risk guardian seeded");
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate (synchronous, called from the executor's submit)
    // -------------------------------------------------------------------------

    /// Check whether `intent` is allowed right now. Closing and urgent
    /// intents always pass: positions must remain closable in every mode.
    pub fn pre_trade(
        &self,
        intent: &Intent,
        portfolio: &PortfolioManager,
    ) -> Result<(), RiskVeto> {
        if intent.kind.is_close() || intent.urgent {
            return Ok(());
        }

        let cfg = self.config.read();
        let s = self.state.read();

        if let Some(detail) = &s.invariant_breach {
            return Err(RiskVeto::InvariantBreach {
                detail: detail.clone(),
            });
        }
        if s.safe_mode {
            return Err(RiskVeto::SafeMode {
                drawdown_pct: s.drawdown_pct,
            });
        }
        drop(s);

        let nav = portfolio.nav();
        if nav < cfg.min_nav_floor {
            return Err(RiskVeto::NavFloor {
                nav,
                floor: cfg.min_nav_floor,
            });
        }

        let delta_bps = portfolio.delta().abs() * 10_000.0;
        if delta_bps > cfg.delta_block_bps {
            return Err(RiskVeto::DeltaBlock {
                delta_bps,
                block_bps: cfg.delta_block_bps,
            });
        }

        let pair_notional = portfolio.pair_notional(&intent.pair) + intent.target_notional;
        if pair_notional > cfg.max_pair_notional {
            return Err(RiskVeto::PairCap {
                pair_notional,
                cap: cfg.max_pair_notional,
            });
        }

        let aggregate = portfolio.aggregate_notional() + intent.target_notional;
        if aggregate > cfg.max_aggregate_notional {
            return Err(RiskVeto::AggregateCap {
                aggregate,
                cap: cfg.max_aggregate_notional,
            });
        }

        let utilization = portfolio.margin_utilization();
        if utilization >= 1.0 {
            return Err(RiskVeto::LeverageCap { utilization });
        }

        Ok(())
    }

    /// Position sizing multiplier under the current drawdown tier.
    pub fn size_multiplier(&self) -> f64 {
        if self.state.read().reduce_tier_active {
            0.5
        } else {
            1.0
        }
    }

    pub fn in_safe_mode(&self) -> bool {
        self.state.read().safe_mode
    }

    /// Record an invariant violation. Blocks all new opens until an operator
    /// intervenes; never auto-recovers.
    pub fn note_invariant_violation(&self, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(detail = %detail, "invariant violation recorded");
        self.state.write().invariant_breach = Some(detail.clone());
        self.bus.publish(EngineEvent::InvariantViolation { detail });
    }

    // -------------------------------------------------------------------------
    // Monitor tick (async, periodic)
    // -------------------------------------------------------------------------

    /// Recompute NAV-derived state: daily roll, drawdown tiers, the delta
    /// envelope, per-position loss reviews, and portfolio invariants.
    pub fn monitor_tick(&self, portfolio: &PortfolioManager) -> MonitorOutcome {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let nav = portfolio.nav();
        let mut outcome = MonitorOutcome::default();

        let (dd_reduce, dd_safe, delta_warn_bps, review_pct) = {
            let cfg = self.config.read();
            (
                cfg.dd_reduce_pct,
                cfg.dd_safe_pct,
                cfg.delta_warn_bps,
                cfg.unrealized_loss_review_pct,
            )
        };

        {
            let mut s = self.state.write();
            self.roll_if_needed(&mut s, &today, nav, dd_reduce);

            if s.day_start_nav <= 0.0 {
                s.day_start_nav = nav;
                s.peak_nav = nav;
            }
            if nav > s.peak_nav {
                s.peak_nav = nav;
            }
            s.drawdown_pct = if s.peak_nav > 0.0 {
                (s.peak_nav - nav) / s.peak_nav * 100.0
            } else {
                0.0
            };
            s.max_drawdown_today = s.max_drawdown_today.max(s.drawdown_pct);

            if s.drawdown_pct > dd_reduce && !s.reduce_tier_active {
                s.reduce_tier_active = true;
                self.bus.publish(EngineEvent::DrawdownTier {
                    drawdown_pct: s.drawdown_pct,
                    tier: "reduced".to_string(),
                });
                warn!(drawdown_pct = s.drawdown_pct, "drawdown reduce tier engaged");
            }

            if s.drawdown_pct > dd_safe && !s.safe_mode {
                s.safe_mode = true;
                outcome.entered_safe_mode = true;
                self.bus.publish(EngineEvent::SafeMode {
                    entered: true,
                    drawdown_pct: s.drawdown_pct,
                });
                warn!(drawdown_pct = s.drawdown_pct, "SAFE_MODE engaged");
            }
        }

        // Delta envelope warning.
        let delta_bps = portfolio.delta().abs() * 10_000.0;
        if delta_bps > delta_warn_bps {
            self.bus.publish(EngineEvent::DeltaWarning { delta_bps });
        }

        // Per-position unrealized-loss review flags, raised once per position.
        for position in portfolio.positions() {
            let Some(marks) = portfolio.marks(&position.pair) else {
                continue;
            };
            let notional = position.notional(&marks);
            if notional <= 0.0 {
                continue;
            }
            let loss_pct = -position.unrealized(&marks) / notional * 100.0;
            if loss_pct > review_pct {
                let mut s = self.state.write();
                if s.flagged_positions.insert(position.id.clone()) {
                    drop(s);
                    self.bus.publish(EngineEvent::PositionReviewFlag {
                        pair: position.pair.clone(),
                        kind: position.kind,
                        unrealized_loss_pct: loss_pct,
                    });
                }
            }
        }

        // Delta-tolerance invariant per position.
        for violation in portfolio.invariant_violations() {
            let already = self.state.read().invariant_breach.is_some();
            if !already {
                self.note_invariant_violation(violation);
            }
        }

        outcome
    }

    /// Daily roll: reset the drawdown base; SAFE_MODE exits only when the
    /// previous day's worst drawdown stayed below the reduce tier.
    fn roll_if_needed(&self, s: &mut Inner, today: &str, nav: f64, dd_reduce: f64) {
        if s.current_date == today {
            return;
        }
        info!(
            old_date = %s.current_date,
            new_date = %today,
            "date rolled, resetting daily risk counters"
        );

        if s.safe_mode && s.max_drawdown_today < dd_reduce {
            s.safe_mode = false;
            self.bus.publish(EngineEvent::SafeMode {
                entered: false,
                drawdown_pct: s.max_drawdown_today,
            });
            info!("SAFE_MODE cleared after calm daily roll");
        }

        s.current_date = today.to_string();
        s.day_start_nav = nav;
        s.peak_nav = nav;
        s.drawdown_pct = 0.0;
        s.max_drawdown_today = 0.0;
        s.reduce_tier_active = false;
    }

    pub fn state(&self) -> RiskStateSnapshot {
        let s = self.state.read();
        RiskStateSnapshot {
            safe_mode: s.safe_mode,
            size_multiplier: if s.reduce_tier_active { 0.5 } else { 1.0 },
            day_start_nav: s.day_start_nav,
            peak_nav: s.peak_nav,
            drawdown_pct: s.drawdown_pct,
            invariant_breach: s.invariant_breach.clone(),
            current_date: s.current_date.clone(),
        }
    }
}

impl std::fmt::Debug for RiskGuardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskGuardian")
            .field("safe_mode", &s.safe_mode)
            .field("drawdown_pct", &s.drawdown_pct)
            .field("invariant_breach", &s.invariant_breach)
            .finish()
    }
}
