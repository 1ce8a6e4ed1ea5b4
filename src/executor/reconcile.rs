// =============================================================================
// Partial-fill reconciliation: keeping the two legs delta-neutral
// =============================================================================
//
// On every fill event the executor recomputes the signed filled imbalance
// between the two legs. When the imbalance notional exceeds the tolerance,
// the trailing leg is resized down to the leading leg's fill, or, if the
// trailing leg can no longer trade, a micro-order on the leading leg's
// opposite side nulls the residual delta. Pure planning lives here; the
// executor performs the actions.
// =============================================================================

use crate::executor::intent::LegOrder;
use crate::types::{MarketKind, Side};

/// Planned corrective action for a filled-leg imbalance.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Imbalance within tolerance; nothing to do.
    None,
    /// Shrink the still-working trailing leg's total quantity to the leading
    /// leg's filled quantity.
    ResizeTrailing { market: MarketKind, new_qty: f64 },
    /// Both legs are terminal; null the residual delta with an opposite-side
    /// order on the leading leg's market.
    MicroOrder {
        market: MarketKind,
        side: Side,
        qty: f64,
    },
}

/// Signed filled imbalance in base quantity. A perfectly hedged pair of legs
/// sums to zero because the legs take opposite sides.
pub fn filled_imbalance_qty(spot: &LegOrder, perp: &LegOrder) -> f64 {
    spot.signed_filled_qty() + perp.signed_filled_qty()
}

/// Imbalance in quote notional at `ref_price`.
pub fn filled_imbalance_notional(spot: &LegOrder, perp: &LegOrder, ref_price: f64) -> f64 {
    filled_imbalance_qty(spot, perp) * ref_price
}

/// Plan the corrective action for the current leg states.
pub fn plan(
    spot: &LegOrder,
    perp: &LegOrder,
    ref_price: f64,
    tolerance_notional: f64,
) -> ReconcileAction {
    let delta_qty = filled_imbalance_qty(spot, perp);
    if (delta_qty * ref_price).abs() <= tolerance_notional {
        return ReconcileAction::None;
    }

    let (leading, trailing) = if spot.filled_qty >= perp.filled_qty {
        (spot, perp)
    } else {
        (perp, spot)
    };

    if !trailing.state.is_terminal() {
        ReconcileAction::ResizeTrailing {
            market: trailing.market,
            new_qty: leading.filled_qty,
        }
    } else {
        ReconcileAction::MicroOrder {
            market: leading.market,
            side: leading.side.opposite(),
            qty: delta_qty.abs(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::intent::LegState;

    fn leg(market: MarketKind, side: Side, qty: f64) -> LegOrder {
        LegOrder::new("intent", "binance", "BTCUSDT", market, side, qty, Some(100.0))
    }

    #[test]
    fn balanced_fills_need_no_action() {
        let mut spot = leg(MarketKind::Spot, Side::Buy, 20.0);
        let mut perp = leg(MarketKind::Perp, Side::Sell, 20.0);
        spot.apply_fill(100.0, 20.0, 0.0);
        perp.apply_fill(100.0, 20.0, 0.0);
        assert!(filled_imbalance_qty(&spot, &perp).abs() < 1e-12);
        assert_eq!(plan(&spot, &perp, 100.0, 50.0), ReconcileAction::None);
    }

    #[test]
    fn transient_imbalance_within_tolerance_is_ignored() {
        let mut spot = leg(MarketKind::Spot, Side::Buy, 20.0);
        let perp = leg(MarketKind::Perp, Side::Sell, 20.0);
        spot.apply_fill(100.0, 0.4, 0.0); // 40 notional, tolerance 50
        assert_eq!(plan(&spot, &perp, 100.0, 50.0), ReconcileAction::None);
    }

    #[test]
    fn working_trailing_leg_gets_resized() {
        // Spot leg rejected after a 10-of-20 partial; perp still live at 4.
        let mut spot = leg(MarketKind::Spot, Side::Buy, 20.0);
        spot.apply_fill(100.0, 10.0, 0.0);
        spot.state = LegState::Rejected;

        let mut perp = leg(MarketKind::Perp, Side::Sell, 20.0);
        perp.apply_fill(100.0, 4.0, 0.0);
        perp.state = LegState::Live;

        match plan(&spot, &perp, 100.0, 50.0) {
            ReconcileAction::ResizeTrailing { market, new_qty } => {
                assert_eq!(market, MarketKind::Perp);
                assert!((new_qty - 10.0).abs() < 1e-12);
            }
            other => panic!("expected resize, got {other:?}"),
        }
    }

    /// S2 shape: spot fills 1000 notional then rejects, perp fills 2000.
    /// Expect a compensating perp-buy of 1000 notional.
    #[test]
    fn terminal_legs_compensate_with_micro_order() {
        let mut spot = leg(MarketKind::Spot, Side::Buy, 20.0);
        spot.apply_fill(100.0, 10.0, 0.0);
        spot.state = LegState::Rejected;

        let mut perp = leg(MarketKind::Perp, Side::Sell, 20.0);
        perp.apply_fill(100.0, 20.0, 0.0);

        match plan(&spot, &perp, 100.0, 50.0) {
            ReconcileAction::MicroOrder { market, side, qty } => {
                assert_eq!(market, MarketKind::Perp);
                assert_eq!(side, Side::Buy);
                assert!((qty - 10.0).abs() < 1e-12, "qty {qty}");
            }
            other => panic!("expected micro order, got {other:?}"),
        }
    }

    #[test]
    fn micro_order_direction_flips_with_leading_side() {
        // Close-hedge direction: sell spot / buy perp; spot leads.
        let mut spot = leg(MarketKind::Spot, Side::Sell, 20.0);
        spot.apply_fill(100.0, 20.0, 0.0);

        let mut perp = leg(MarketKind::Perp, Side::Buy, 20.0);
        perp.apply_fill(100.0, 5.0, 0.0);
        perp.state = LegState::Canceled;

        match plan(&spot, &perp, 100.0, 50.0) {
            ReconcileAction::MicroOrder { market, side, qty } => {
                assert_eq!(market, MarketKind::Spot);
                assert_eq!(side, Side::Buy);
                assert!((qty - 15.0).abs() < 1e-12);
            }
            other => panic!("expected micro order, got {other:?}"),
        }
    }
}
