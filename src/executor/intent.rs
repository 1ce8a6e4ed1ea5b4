// =============================================================================
// Intents, leg orders, fills: the executor's state model
// =============================================================================
//
// An Intent is immutable once emitted; the executor owns it until a terminal
// state. Each Intent drives exactly two leg orders (spot and perp) whose
// lifecycles are tracked independently; the Intent terminates only when both
// legs are terminal or a compensating reversal has been executed.
//
// Transitions outside the table below are invariant violations and surface
// as errors, never panics.
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::router::RouteDecision;
use crate::types::{now_ms, MarketKind, PairId, PositionKind, Side};

/// What an intent is trying to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    OpenHedge,
    CloseHedge,
    VacuumOpen,
    VacuumClose,
}

impl IntentKind {
    /// Closing intents remain allowed in SAFE_MODE and under delta blocks.
    pub fn is_close(self) -> bool {
        matches!(self, Self::CloseHedge | Self::VacuumClose)
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenHedge => write!(f, "OPEN_HEDGE"),
            Self::CloseHedge => write!(f, "CLOSE_HEDGE"),
            Self::VacuumOpen => write!(f, "VACUUM_OPEN"),
            Self::VacuumClose => write!(f, "VACUUM_CLOSE"),
        }
    }
}

/// Why an intent was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentCause {
    /// z-score trigger with the observed value.
    ZScore { z: f64 },
    /// Core allocation drift correction.
    CoreRebalance,
    /// Liquidation-correlated dislocation with detection confidence.
    Vacuum { confidence: f64 },
    /// Risk-driven forced close.
    Emergency,
    Manual,
}

impl std::fmt::Display for IntentCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZScore { z } => write!(f, "z={z:.3}"),
            Self::CoreRebalance => write!(f, "core_rebalance"),
            Self::Vacuum { confidence } => write!(f, "vacuum(conf={confidence:.2})"),
            Self::Emergency => write!(f, "emergency"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A desired atomic two-leg action. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub kind: IntentKind,
    pub pair: PairId,
    /// Side of the SPOT leg; the perp leg takes the opposite side.
    pub direction: Side,
    pub target_notional: f64,
    pub max_slippage_bps: f64,
    pub ttl_ms: u64,
    pub cause: IntentCause,
    pub created_at_ms: i64,
    /// Convergence target carried by vacuum intents.
    pub target_basis: Option<f64>,
    /// Risk-urgent intents bypass TWAP slicing.
    pub urgent: bool,
}

impl Intent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: IntentKind,
        pair: PairId,
        direction: Side,
        target_notional: f64,
        max_slippage_bps: f64,
        ttl_ms: u64,
        cause: IntentCause,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            pair,
            direction,
            target_notional,
            max_slippage_bps,
            ttl_ms,
            cause,
            created_at_ms: now_ms(),
            target_basis: None,
            urgent: false,
        }
    }

    pub fn with_target_basis(mut self, target: f64) -> Self {
        self.target_basis = Some(target);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn deadline_ms(&self) -> i64 {
        self.created_at_ms + self.ttl_ms as i64
    }

    pub fn perp_side(&self) -> Side {
        self.direction.opposite()
    }

    pub fn side_for(&self, market: MarketKind) -> Side {
        match market {
            MarketKind::Spot => self.direction,
            MarketKind::Perp => self.perp_side(),
        }
    }

    /// Which book-keeping bucket this intent trades against.
    pub fn position_kind(&self) -> PositionKind {
        match self.kind {
            IntentKind::VacuumOpen | IntentKind::VacuumClose => PositionKind::Vacuum,
            _ => {
                if matches!(self.cause, IntentCause::CoreRebalance) {
                    PositionKind::Core
                } else {
                    PositionKind::Satellite
                }
            }
        }
    }
}

// =============================================================================
// Intent state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    Created,
    Placing,
    Live,
    Reconciling,
    Compensating,
    Done,
    Compensated,
    Failed,
    TimedOut,
}

impl IntentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Compensated | Self::Failed | Self::TimedOut
        )
    }

    /// The legal transition table. Compensation is a first-class state, not a
    /// side branch.
    pub fn can_transition(self, to: IntentState) -> bool {
        use IntentState::*;
        matches!(
            (self, to),
            (Created, Placing)
                | (Placing, Live)
                | (Placing, Failed)
                | (Placing, TimedOut)
                | (Placing, Compensating)
                | (Live, Reconciling)
                | (Live, Compensating)
                | (Live, Failed)
                | (Live, TimedOut)
                | (Live, Done)
                | (Reconciling, Done)
                | (Reconciling, Compensating)
                | (Reconciling, TimedOut)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }
}

impl std::fmt::Display for IntentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Created => "CREATED",
            Self::Placing => "PLACING",
            Self::Live => "LIVE",
            Self::Reconciling => "RECONCILING",
            Self::Compensating => "COMPENSATING",
            Self::Done => "DONE",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        };
        write!(f, "{label}")
    }
}

/// Terminal outcome of an intent, carried in the result and the trade record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentOutcome {
    Done,
    Compensated,
    TimedOut,
    /// Both legs rejected; retryable subject to policy.
    BothFailed,
    Rejected { reason: String },
    Aborted { reason: String },
}

impl std::fmt::Display for IntentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "DONE"),
            Self::Compensated => write!(f, "COMPENSATED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::BothFailed => write!(f, "BOTH_FAILED"),
            Self::Rejected { reason } => write!(f, "REJECTED({reason})"),
            Self::Aborted { reason } => write!(f, "ABORTED({reason})"),
        }
    }
}

// =============================================================================
// Leg orders & fills
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegState {
    Pending,
    Live,
    Filled,
    Partial,
    Canceled,
    Rejected,
    TimedOut,
}

impl LegState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Live)
    }
}

impl std::fmt::Display for LegState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Live => "LIVE",
            Self::Filled => "FILLED",
            Self::Partial => "PARTIAL",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::TimedOut => "TIMED_OUT",
        };
        write!(f, "{label}")
    }
}

/// An exchange-level order on one side of an intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegOrder {
    /// Venue-assigned order id; empty until placement succeeds.
    pub id: String,
    pub intent_id: String,
    pub venue: String,
    pub instrument: String,
    pub market: MarketKind,
    pub side: Side,
    pub qty: f64,
    pub price: Option<f64>,
    pub state: LegState,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub fees: f64,
}

impl LegOrder {
    pub fn new(
        intent_id: &str,
        venue: &str,
        instrument: &str,
        market: MarketKind,
        side: Side,
        qty: f64,
        price: Option<f64>,
    ) -> Self {
        Self {
            id: String::new(),
            intent_id: intent_id.to_string(),
            venue: venue.to_string(),
            instrument: instrument.to_string(),
            market,
            side,
            qty,
            price,
            state: LegState::Pending,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            fees: 0.0,
        }
    }

    /// Fold a fill into the leg's running totals.
    pub fn apply_fill(&mut self, price: f64, qty: f64, fee: f64) {
        let prior_notional = self.avg_fill_price * self.filled_qty;
        self.filled_qty += qty;
        if self.filled_qty > 0.0 {
            self.avg_fill_price = (prior_notional + price * qty) / self.filled_qty;
        }
        self.fees += fee;
        if self.filled_qty >= self.qty - 1e-12 {
            self.state = LegState::Filled;
        } else {
            self.state = LegState::Partial;
        }
    }

    pub fn filled_notional(&self) -> f64 {
        self.filled_qty * self.avg_fill_price
    }

    /// Signed base quantity: positive when buying.
    pub fn signed_filled_qty(&self) -> f64 {
        self.filled_qty * self.side.sign()
    }
}

/// A single execution report, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub leg_order_id: String,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub t_exchange: i64,
    pub t_ingress: i64,
    pub ingress_seq: u64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> PairId {
        PairId::new("binance", "BTCUSDT")
    }

    #[test]
    fn transition_table_allows_happy_path() {
        use IntentState::*;
        let path = [Created, Placing, Live, Reconciling, Done];
        for window in path.windows(2) {
            assert!(
                window[0].can_transition(window[1]),
                "{} -> {} should be legal",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn transition_table_allows_compensation_path() {
        use IntentState::*;
        assert!(Live.can_transition(Compensating));
        assert!(Reconciling.can_transition(Compensating));
        assert!(Compensating.can_transition(Compensated));
        assert!(Compensating.can_transition(Failed));
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        use IntentState::*;
        for terminal in [Done, Compensated, Failed, TimedOut] {
            assert!(terminal.is_terminal());
            for to in [
                Created,
                Placing,
                Live,
                Reconciling,
                Compensating,
                Done,
                Compensated,
                Failed,
                TimedOut,
            ] {
                assert!(
                    !terminal.can_transition(to),
                    "{terminal} -> {to} must be illegal"
                );
            }
        }
    }

    #[test]
    fn backwards_transitions_are_illegal() {
        use IntentState::*;
        assert!(!Live.can_transition(Placing));
        assert!(!Reconciling.can_transition(Live));
        assert!(!Done.can_transition(Compensating));
        assert!(!Created.can_transition(Live));
    }

    #[test]
    fn intent_sides_are_opposed() {
        let intent = Intent::new(
            IntentKind::OpenHedge,
            pair(),
            Side::Buy,
            2000.0,
            25.0,
            5000,
            IntentCause::ZScore { z: 2.5 },
        );
        assert_eq!(intent.side_for(MarketKind::Spot), Side::Buy);
        assert_eq!(intent.side_for(MarketKind::Perp), Side::Sell);
        assert_eq!(intent.deadline_ms(), intent.created_at_ms + 5000);
    }

    #[test]
    fn leg_fill_accumulation_and_average() {
        let mut leg = LegOrder::new(
            "intent-1",
            "binance",
            "BTCUSDT",
            MarketKind::Spot,
            Side::Buy,
            10.0,
            Some(100.0),
        );
        leg.apply_fill(100.0, 4.0, 0.4);
        assert_eq!(leg.state, LegState::Partial);
        leg.apply_fill(101.0, 6.0, 0.6);
        assert_eq!(leg.state, LegState::Filled);
        assert!((leg.filled_qty - 10.0).abs() < 1e-12);
        let expected_avg = (100.0 * 4.0 + 101.0 * 6.0) / 10.0;
        assert!((leg.avg_fill_price - expected_avg).abs() < 1e-12);
        assert!((leg.fees - 1.0).abs() < 1e-12);
    }

    #[test]
    fn leg_signed_qty_respects_side() {
        let mut buy = LegOrder::new(
            "i",
            "binance",
            "BTCUSDT",
            MarketKind::Spot,
            Side::Buy,
            5.0,
            None,
        );
        buy.apply_fill(100.0, 5.0, 0.0);
        assert!(buy.signed_filled_qty() > 0.0);

        let mut sell = LegOrder::new(
            "i",
            "binance",
            "BTCUSDT",
            MarketKind::Perp,
            Side::Sell,
            5.0,
            None,
        );
        sell.apply_fill(100.0, 5.0, 0.0);
        assert!(sell.signed_filled_qty() < 0.0);
    }
}
