// =============================================================================
// Vacuum Detector: liquidation-correlated basis dislocations
// =============================================================================
//
// Liquidation cascades drag the perp away from spot faster than arbitrage can
// absorb; the detector watches for a basis beyond the vacuum threshold that
// coincides with same-direction forced closes inside the sliding window, and
// emits a VACUUM_OPEN intent toward the convergence target.
//
// Long liquidations force perp selling, so they pair with a negative basis
// and a long-perp / short-spot capture; short liquidations mirror. Confidence
// rises with the count and size of correlated liquidations; below the floor
// nothing is emitted.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::SentinelConfig;
use crate::executor::intent::{Intent, IntentCause, IntentKind};
use crate::market_data::liquidation::{LiquidationEvent, LiquidationWindow};
use crate::portfolio::PortfolioManager;
use crate::types::{PairId, PositionKind, Side};

pub struct VacuumDetector {
    config: Arc<RwLock<SentinelConfig>>,
    window: LiquidationWindow,
}

impl VacuumDetector {
    pub fn new(config: Arc<RwLock<SentinelConfig>>) -> Self {
        let (window_ms, min_liq) = {
            let cfg = config.read();
            (cfg.vacuum_window_ms, cfg.vacuum_min_liq)
        };
        Self {
            config,
            window: LiquidationWindow::new(window_ms, min_liq),
        }
    }

    /// Feed one liquidation event into the sliding window.
    pub fn record_liquidation(&self, pair: &PairId, event: LiquidationEvent) {
        self.window.record(pair, event);
    }

    /// Evaluate a fresh basis sample against the liquidation window.
    ///
    /// Returns a VACUUM_OPEN intent when the dislocation is wide enough,
    /// side-correlated liquidations exist, confidence clears the floor, and
    /// no vacuum position for the pair is already open.
    pub fn on_basis_update(
        &self,
        pair: &PairId,
        basis: f64,
        at_ms: i64,
        portfolio: &PortfolioManager,
    ) -> Option<Intent> {
        let cfg = self.config.read().clone();
        if basis.abs() < cfg.vacuum_threshold {
            return None;
        }

        // Negative basis pairs with long liquidations (forced perp selling);
        // positive basis with short liquidations.
        let (liq_side, direction) = if basis < 0.0 {
            (Side::Buy, Side::Sell) // long perp, short spot
        } else {
            (Side::Sell, Side::Buy) // short perp, long spot
        };

        let (count, total_notional) = self.window.matching(pair, liq_side, at_ms);
        if count == 0 {
            return None;
        }

        let confidence = Self::confidence(count, total_notional, cfg.vacuum_min_liq);
        if confidence < cfg.vacuum_min_confidence {
            debug!(
                pair = %pair,
                basis,
                confidence,
                "vacuum candidate below confidence floor"
            );
            return None;
        }

        if portfolio.has_position(pair, PositionKind::Vacuum) {
            return None;
        }

        let notional = cfg.base_notional * confidence;
        if notional < cfg.min_intent_notional {
            return None;
        }

        info!(
            pair = %pair,
            basis,
            liquidations = count,
            liq_notional = total_notional,
            confidence,
            "vacuum dislocation detected"
        );

        Some(
            Intent::new(
                IntentKind::VacuumOpen,
                pair.clone(),
                direction,
                notional,
                cfg.max_slippage_bps,
                cfg.intent_ttl_ms,
                IntentCause::Vacuum { confidence },
            )
            .with_target_basis(cfg.vacuum_target_basis),
        )
    }

    /// Scan open vacuum positions for convergence or holding-period expiry.
    pub fn check_open_vacuums(
        &self,
        portfolio: &PortfolioManager,
        basis_now: impl Fn(&PairId) -> Option<f64>,
        at_ms: i64,
    ) -> Vec<Intent> {
        let cfg = self.config.read().clone();
        let epsilon = cfg.vacuum_convergence_bps / 10_000.0;
        let max_hold_ms = (cfg.vacuum_max_hold_s * 1000) as i64;
        let mut closes = Vec::new();

        for position in portfolio.positions() {
            if position.kind != PositionKind::Vacuum {
                continue;
            }
            let target = position.target_basis.unwrap_or(cfg.vacuum_target_basis);

            let expired = at_ms - position.opened_at_ms >= max_hold_ms;
            let converged = basis_now(&position.pair)
                .map(|basis| {
                    if position.entry_basis <= target {
                        basis >= target - epsilon
                    } else {
                        basis <= target + epsilon
                    }
                })
                .unwrap_or(false);

            if !(expired || converged) {
                continue;
            }

            let Some(marks) = portfolio.marks(&position.pair) else {
                continue;
            };
            let notional = position.notional(&marks);
            if notional <= 0.0 {
                continue;
            }

            info!(
                pair = %position.pair,
                converged,
                expired,
                "closing vacuum position"
            );

            let direction = if position.spot_qty >= 0.0 {
                Side::Sell
            } else {
                Side::Buy
            };
            closes.push(Intent::new(
                IntentKind::VacuumClose,
                position.pair.clone(),
                direction,
                notional,
                cfg.max_slippage_bps,
                cfg.intent_ttl_ms,
                IntentCause::Vacuum { confidence: 1.0 },
            ));
        }
        closes
    }

    /// Confidence in [0, 1]: half from the event count, half from the total
    /// notional relative to three floor-sized liquidations.
    fn confidence(count: usize, total_notional: f64, min_liq: f64) -> f64 {
        let count_part = (count as f64 / 3.0).min(1.0);
        let size_part = if min_liq > 0.0 {
            (total_notional / (3.0 * min_liq)).min(1.0)
        } else {
            1.0
        };
        0.5 * count_part + 0.5 * size_part
    }
}

impl std::fmt::Debug for VacuumDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VacuumDetector")
            .field("window", &self.window)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::WalletBalances;
    use rust_decimal_macros::dec as d;
    use std::collections::HashMap;

    fn setup() -> (VacuumDetector, PortfolioManager, PairId) {
        let config = Arc::new(RwLock::new(SentinelConfig::default()));
        let detector = VacuumDetector::new(config.clone());
        let portfolio = PortfolioManager::new(config);
        portfolio.set_wallets_from(&WalletBalances {
            spot_usdt: d!(10_000),
            perp_margin: d!(5_000),
            spot_assets: HashMap::new(),
        });
        let pair = PairId::new("binance", "BTCUSDT");
        portfolio.update_marks(&pair, 100.0, 100.0);
        (detector, portfolio, pair)
    }

    fn liq(side: Side, notional: f64, at_ms: i64) -> LiquidationEvent {
        LiquidationEvent {
            venue: "binance".into(),
            symbol: "BTCUSDT".into(),
            side,
            notional,
            price: 100.0,
            at_ms,
        }
    }

    /// S4: two long-side liquidations totalling 3M inside 4s, then a -0.8%
    /// basis, produce one VACUUM_OPEN (long perp / short spot).
    #[test]
    fn long_liquidations_with_negative_basis_open_vacuum() {
        let (detector, portfolio, pair) = setup();
        detector.record_liquidation(&pair, liq(Side::Buy, 1_500_000.0, 1_000));
        detector.record_liquidation(&pair, liq(Side::Buy, 1_500_000.0, 5_000));

        let intent = detector
            .on_basis_update(&pair, -0.008, 6_000, &portfolio)
            .expect("vacuum intent expected");
        assert_eq!(intent.kind, IntentKind::VacuumOpen);
        // Short spot leg implies long perp.
        assert_eq!(intent.direction, Side::Sell);
        assert_eq!(intent.target_basis, Some(0.0));
        assert!(matches!(intent.cause, IntentCause::Vacuum { confidence } if confidence >= 0.3));
    }

    #[test]
    fn short_liquidations_pair_with_positive_basis() {
        let (detector, portfolio, pair) = setup();
        detector.record_liquidation(&pair, liq(Side::Sell, 2_000_000.0, 1_000));

        let intent = detector
            .on_basis_update(&pair, 0.008, 2_000, &portfolio)
            .expect("vacuum intent expected");
        assert_eq!(intent.direction, Side::Buy);
    }

    /// Side mismatch: long liquidations with a positive basis emit nothing.
    #[test]
    fn mismatched_side_emits_nothing() {
        let (detector, portfolio, pair) = setup();
        detector.record_liquidation(&pair, liq(Side::Buy, 2_000_000.0, 1_000));
        assert!(detector
            .on_basis_update(&pair, 0.008, 2_000, &portfolio)
            .is_none());
    }

    #[test]
    fn shallow_basis_emits_nothing() {
        let (detector, portfolio, pair) = setup();
        detector.record_liquidation(&pair, liq(Side::Buy, 2_000_000.0, 1_000));
        assert!(detector
            .on_basis_update(&pair, -0.004, 2_000, &portfolio)
            .is_none());
    }

    #[test]
    fn low_confidence_emits_nothing() {
        let (detector, portfolio, pair) = setup();
        // A single barely-qualifying liquidation: confidence
        // 0.5/3 + 0.5/3 = 0.33 with defaults, so shrink it further by
        // raising the floor.
        detector
            .config
            .write()
            .vacuum_min_confidence = 0.5;
        detector.record_liquidation(&pair, liq(Side::Buy, 1_000_000.0, 1_000));
        assert!(detector
            .on_basis_update(&pair, -0.008, 2_000, &portfolio)
            .is_none());
    }

    #[test]
    fn open_vacuum_suppresses_duplicates() {
        let (detector, portfolio, pair) = setup();
        portfolio.open_position(
            &pair,
            PositionKind::Vacuum,
            -10.0,
            10.0,
            100.0,
            99.2,
            -0.008,
            Some(0.0),
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
        );
        detector.record_liquidation(&pair, liq(Side::Buy, 3_000_000.0, 1_000));
        assert!(detector
            .on_basis_update(&pair, -0.008, 2_000, &portfolio)
            .is_none());
    }

    /// S4 epilogue: the vacuum closes when the basis returns to within the
    /// convergence epsilon of the target.
    #[test]
    fn convergence_closes_vacuum() {
        let (detector, portfolio, pair) = setup();
        portfolio.open_position(
            &pair,
            PositionKind::Vacuum,
            -10.0,
            10.0,
            100.0,
            99.2,
            -0.008,
            Some(0.0),
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
        );

        // Still far from target: no close.
        let closes = detector.check_open_vacuums(&portfolio, |_| Some(-0.004), 10_000);
        assert!(closes.is_empty());

        // Within 10 bps of target: close fires, buying back the short spot.
        let closes = detector.check_open_vacuums(&portfolio, |_| Some(-0.0005), 10_000);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].kind, IntentKind::VacuumClose);
        assert_eq!(closes[0].direction, Side::Buy);
    }

    #[test]
    fn max_hold_expiry_closes_vacuum() {
        let (detector, portfolio, pair) = setup();
        portfolio.open_position(
            &pair,
            PositionKind::Vacuum,
            -10.0,
            10.0,
            100.0,
            99.2,
            -0.008,
            Some(0.0),
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
        );
        let opened_at = portfolio.positions()[0].opened_at_ms;

        // Basis never converges, but the holding budget runs out.
        let late = opened_at + 900 * 1000 + 1;
        let closes = detector.check_open_vacuums(&portfolio, |_| Some(-0.006), late);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].kind, IntentKind::VacuumClose);
    }
}
