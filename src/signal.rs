// =============================================================================
// Signal Generator: mapping basis statistics to trade intents
// =============================================================================
//
// Evaluated once per signal tick. For each pair the generator emits at most
// one intent; across pairs candidates are ranked by
//
//   |z| * sqrt(sample_count) * min(depth_ratio, 1)
//
// so the strongest, best-evidenced, most-fillable dislocation goes first.
// A pair with a non-terminal in-flight intent is skipped entirely, and an
// UNSAFE pair's signals are suppressed. NAV below the floor or delta beyond
// the block threshold stops opens; closes always remain allowed.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::SentinelConfig;
use crate::executor::intent::{Intent, IntentCause, IntentKind};
use crate::market_data::book::BookManager;
use crate::portfolio::PortfolioManager;
use crate::risk::RiskGuardian;
use crate::stats::StatEngine;
use crate::types::{MarketKind, PairHealth, PairId, PairSpec, PositionKind, Side};

/// A ranked candidate produced during one evaluation tick.
#[derive(Debug, Clone)]
pub struct RankedIntent {
    pub score: f64,
    pub intent: Intent,
}

pub struct SignalGenerator {
    config: Arc<RwLock<SentinelConfig>>,
}

impl SignalGenerator {
    pub fn new(config: Arc<RwLock<SentinelConfig>>) -> Self {
        Self { config }
    }

    /// Evaluate all pairs and return ranked intents, strongest first.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        pairs: &[PairSpec],
        stats: &StatEngine,
        books: &BookManager,
        portfolio: &PortfolioManager,
        risk: &RiskGuardian,
        in_flight: impl Fn(&PairId) -> bool,
        now_ms: i64,
    ) -> Vec<Intent> {
        let cfg = self.config.read().clone();
        let nav = portfolio.nav();
        let delta_bps = portfolio.delta().abs() * 10_000.0;
        let opens_blocked =
            nav < cfg.min_nav_floor || delta_bps > cfg.delta_block_bps || risk.in_safe_mode();
        let size_multiplier = risk.size_multiplier();

        let mut candidates: Vec<RankedIntent> = Vec::new();

        for spec in pairs {
            let pair = &spec.pair;

            // One outstanding intent per pair; new triggers are suppressed.
            if in_flight(pair) {
                continue;
            }
            if stats.health(pair, now_ms) != PairHealth::Fresh {
                continue;
            }
            let Ok(pair_stats) = stats.stats(pair) else {
                continue;
            };

            let depth_ratio = Self::depth_ratio(books, pair, cfg.base_notional);
            let score = pair_stats.z.abs() * (pair_stats.count as f64).sqrt() * depth_ratio;

            // 1. Satellite close: mean reversion complete.
            if pair_stats.z <= cfg.z_close {
                if let Some(position) = portfolio.position(pair, PositionKind::Satellite) {
                    if let Some(marks) = portfolio.marks(pair) {
                        let notional = position.notional(&marks);
                        if notional >= cfg.min_intent_notional {
                            debug!(pair = %pair, z = pair_stats.z, "satellite close triggered");
                            candidates.push(RankedIntent {
                                score,
                                intent: Intent::new(
                                    IntentKind::CloseHedge,
                                    pair.clone(),
                                    Side::Sell,
                                    notional,
                                    cfg.max_slippage_bps,
                                    cfg.intent_ttl_ms,
                                    IntentCause::ZScore { z: pair_stats.z },
                                ),
                            });
                            continue;
                        }
                    }
                }
            }

            // 2. Satellite open: basis statistically expensive.
            if pair_stats.z >= cfg.z_open && !opens_blocked {
                let satellite_cap = nav * cfg.satellite_allocation_pct / 100.0;
                let headroom = satellite_cap - portfolio.notional_of_kind(PositionKind::Satellite);
                let notional = (cfg.base_notional * size_multiplier).min(headroom);
                if notional >= cfg.min_intent_notional {
                    debug!(pair = %pair, z = pair_stats.z, notional, "satellite open triggered");
                    candidates.push(RankedIntent {
                        score,
                        intent: Intent::new(
                            IntentKind::OpenHedge,
                            pair.clone(),
                            Side::Buy,
                            notional,
                            cfg.max_slippage_bps,
                            cfg.intent_ttl_ms,
                            IntentCause::ZScore { z: pair_stats.z },
                        ),
                    });
                    continue;
                }
            }

            // 3. Core allocation drift, corrected stepwise regardless of z.
            if let Some(intent) = self.core_rebalance_intent(
                &cfg,
                spec,
                portfolio,
                nav,
                opens_blocked,
                size_multiplier,
            ) {
                candidates.push(RankedIntent { score: 0.0, intent });
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.into_iter().map(|c| c.intent).collect()
    }

    /// Stepwise controller toward `core_allocation_pct` of NAV. Each tick
    /// moves at most `core_step_pct` of the remaining gap, which converges
    /// toward the target without bursty reallocations.
    fn core_rebalance_intent(
        &self,
        cfg: &SentinelConfig,
        spec: &PairSpec,
        portfolio: &PortfolioManager,
        nav: f64,
        opens_blocked: bool,
        size_multiplier: f64,
    ) -> Option<Intent> {
        let target = nav * cfg.core_allocation_pct / 100.0;
        let current = portfolio.notional_of_kind(PositionKind::Core);
        let gap = target - current;
        let step = gap.abs() * cfg.core_step_pct / 100.0 * size_multiplier;
        if step < cfg.min_intent_notional {
            return None;
        }

        if gap > 0.0 {
            if opens_blocked {
                return None;
            }
            Some(Intent::new(
                IntentKind::OpenHedge,
                spec.pair.clone(),
                Side::Buy,
                step,
                cfg.max_slippage_bps,
                cfg.intent_ttl_ms,
                IntentCause::CoreRebalance,
            ))
        } else {
            portfolio.position(&spec.pair, PositionKind::Core)?;
            Some(Intent::new(
                IntentKind::CloseHedge,
                spec.pair.clone(),
                Side::Sell,
                step,
                cfg.max_slippage_bps,
                cfg.intent_ttl_ms,
                IntentCause::CoreRebalance,
            ))
        }
    }

    fn depth_ratio(books: &BookManager, pair: &PairId, notional: f64) -> f64 {
        let spot = books
            .get(pair, MarketKind::Spot)
            .map(|b| b.depth_ratio(notional))
            .unwrap_or(1.0);
        let perp = books
            .get(pair, MarketKind::Perp)
            .map(|b| b.depth_ratio(notional))
            .unwrap_or(1.0);
        spot.min(perp).min(1.0)
    }
}

impl std::fmt::Debug for SignalGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGenerator").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::market_data::book::{BookLevel, BookSnapshot};
    use crate::venue::WalletBalances;
    use rust_decimal_macros::dec as d;
    use std::collections::HashMap;

    struct Fixture {
        config: Arc<RwLock<SentinelConfig>>,
        stats: StatEngine,
        books: BookManager,
        portfolio: PortfolioManager,
        risk: RiskGuardian,
        generator: SignalGenerator,
        spec: PairSpec,
        now_ms: i64,
    }

    fn spec_for(symbol: &str) -> PairSpec {
        PairSpec {
            pair: PairId::new("binance", symbol),
            spot_instrument: symbol.to_string(),
            perp_instrument: format!("{symbol}-PERP"),
            tick_size: 0.01,
            lot_size: 0.0001,
            fee_maker_bps: 1.0,
            fee_taker_bps: 4.0,
            min_notional: 10.0,
        }
    }

    fn deep_book(pair: &PairId, market: MarketKind, mid: f64, at_ms: i64) -> BookSnapshot {
        BookSnapshot {
            venue: pair.venue.clone(),
            symbol: pair.symbol.clone(),
            market,
            bids: vec![BookLevel {
                price: mid - 0.05,
                size: 10_000.0,
            }],
            asks: vec![BookLevel {
                price: mid + 0.05,
                size: 10_000.0,
            }],
            seq: at_ms as u64,
            at_ms,
        }
    }

    fn fixture() -> Fixture {
        let config = Arc::new(RwLock::new(SentinelConfig::default()));
        let stats = StatEngine::new(config.clone());
        let books = BookManager::new();
        let portfolio = PortfolioManager::new(config.clone());
        portfolio.set_wallets_from(&WalletBalances {
            spot_usdt: d!(10_000),
            perp_margin: d!(5_000),
            spot_assets: HashMap::new(),
        });
        let risk = RiskGuardian::new(config.clone(), EventBus::new(16));
        risk.seed_nav(15_000.0);
        let generator = SignalGenerator::new(config.clone());
        Fixture {
            config,
            stats,
            books,
            portfolio,
            risk,
            generator,
            spec: spec_for("BTCUSDT"),
            now_ms: 0,
        }
    }

    /// Feed `n` settled samples then one dislocation of `dislocation_pct`.
    fn warm_up(f: &mut Fixture, spec: &PairSpec, n: usize, dislocation: f64) {
        let mut t = f.now_ms + 1_000;
        for i in 0..n {
            let wiggle = if i % 2 == 0 { 0.1 } else { -0.1 };
            ingest(f, spec, 100.0, 100.0 + wiggle, t);
            t += 200;
        }
        if dislocation != 0.0 {
            ingest(f, spec, 100.0, 100.0 + dislocation, t);
            t += 200;
        }
        f.now_ms = t;
    }

    fn ingest(f: &Fixture, spec: &PairSpec, spot_mid: f64, perp_mid: f64, t: i64) {
        let pair = &spec.pair;
        let spot = deep_book(pair, MarketKind::Spot, spot_mid, t);
        let perp = deep_book(pair, MarketKind::Perp, perp_mid, t);
        f.books.update(pair, spot.clone());
        f.books.update(pair, perp.clone());
        f.stats.ingest(spec, &spot, &perp, t).unwrap();
        f.portfolio.update_marks(pair, spot_mid, perp_mid);
    }

    fn evaluate(f: &Fixture, in_flight: bool) -> Vec<Intent> {
        let pairs = vec![f.spec.clone()];
        f.generator.evaluate(
            &pairs,
            &f.stats,
            &f.books,
            &f.portfolio,
            &f.risk,
            |_| in_flight,
            f.now_ms,
        )
    }

    /// S1 trigger: a +25 bps dislocation over a settled window produces one
    /// OpenHedge intent, buy spot / sell perp.
    #[test]
    fn dislocation_triggers_open_hedge() {
        let mut f = fixture();
        // Park the core controller so only the satellite trigger fires.
        f.config.write().core_allocation_pct = 0.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.25); }

        let intents = evaluate(&f, false);
        assert_eq!(intents.len(), 1);
        let intent = &intents[0];
        assert_eq!(intent.kind, IntentKind::OpenHedge);
        assert_eq!(intent.direction, Side::Buy);
        assert!(matches!(intent.cause, IntentCause::ZScore { z } if z > 2.0));
        assert!(intent.target_notional > 0.0);
    }

    /// While an intent for the pair is in flight, nothing new is emitted.
    #[test]
    fn in_flight_pair_is_suppressed() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.25); }

        assert!(!evaluate(&f, false).is_empty());
        assert!(evaluate(&f, true).is_empty());
    }

    /// Mean reversion with an open satellite emits exactly one CloseHedge.
    #[test]
    fn reversion_closes_satellite() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.0); }

        f.portfolio.open_position(
            &f.spec.pair,
            PositionKind::Satellite,
            20.0,
            -20.0,
            100.0,
            100.25,
            0.0025,
            None,
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
        );

        let intents = evaluate(&f, false);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, IntentKind::CloseHedge);
        assert_eq!(intents[0].direction, Side::Sell);
    }

    /// No intents before warmup completes.
    #[test]
    fn warmup_gates_signals() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 10, 0.25); }
        assert!(evaluate(&f, false).is_empty());
    }

    /// An UNSAFE pair (stale ingest) emits nothing even with a hot z.
    #[test]
    fn unsafe_pair_is_suppressed() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.25); }
        // Judge health 30s after the last ingest.
        f.now_ms += 30_000;
        assert!(evaluate(&f, false).is_empty());
    }

    /// NAV floor and delta block stop opens but not closes.
    #[test]
    fn blocks_stop_opens_not_closes() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        f.config.write().min_nav_floor = 1_000_000.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.25); }

        assert!(evaluate(&f, false).is_empty());

        // With an open satellite and a reverted basis, the close still fires.
        let spec = f.spec.clone();
        ingest(&f, &spec, 100.0, 100.0, f.now_ms + 200);
        f.now_ms += 400;
        f.portfolio.open_position(
            &f.spec.pair,
            PositionKind::Satellite,
            20.0,
            -20.0,
            100.0,
            100.25,
            0.0025,
            None,
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
        );
        let intents = evaluate(&f, false);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, IntentKind::CloseHedge);
    }

    /// Pairs are ranked by z * sqrt(count) * depth ratio, strongest first.
    #[test]
    fn ranking_prefers_stronger_dislocation() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        let hot = spec_for("ETHUSDT");
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.25); }
        // Stronger dislocation on the second pair.
        let mut t = 1_000;
        for i in 0..300 {
            let wiggle = if i % 2 == 0 { 0.1 } else { -0.1 };
            ingest(&f, &hot, 100.0, 100.0 + wiggle, t);
            t += 200;
        }
        ingest(&f, &hot, 100.0, 100.6, t);

        let pairs = vec![f.spec.clone(), hot.clone()];
        let intents = f.generator.evaluate(
            &pairs,
            &f.stats,
            &f.books,
            &f.portfolio,
            &f.risk,
            |_| false,
            f.now_ms,
        );
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].pair, hot.pair);
    }

    /// The core controller steps toward the 50% NAV target.
    #[test]
    fn core_controller_steps_toward_target() {
        let mut f = fixture();
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.0); }

        let intents = evaluate(&f, false);
        assert_eq!(intents.len(), 1);
        let intent = &intents[0];
        assert_eq!(intent.kind, IntentKind::OpenHedge);
        assert!(matches!(intent.cause, IntentCause::CoreRebalance));
        // NAV 15000, target 7500, step 10% of the gap.
        assert!((intent.target_notional - 750.0).abs() < 20.0);
    }

    /// Satellite capacity exhausts the open trigger.
    #[test]
    fn satellite_capacity_limits_opens() {
        let mut f = fixture();
        f.config.write().core_allocation_pct = 0.0;
        { let spec = f.spec.clone(); warm_up(&mut f, &spec, 300, 0.25); }

        // Fill the satellite book to its 30% NAV cap.
        f.portfolio.open_position(
            &f.spec.pair,
            PositionKind::Satellite,
            45.0,
            -45.0,
            100.0,
            100.0,
            0.0,
            None,
            rust_decimal::Decimal::ZERO,
            rust_decimal::Decimal::ZERO,
        );

        let intents = evaluate(&f, false);
        assert!(
            intents.is_empty(),
            "expected capacity exhaustion, got {intents:?}"
        );
    }
}
