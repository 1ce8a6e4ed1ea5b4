// =============================================================================
// Margin Rebalancer: tiered collateral management between wallets
// =============================================================================
//
// The perp margin wallet must never starve while the spot side profits (or
// the reverse). Three tiers, checked once per second:
//
//   Compounding  util < margin_compound_pct   excess margin flows back to spot
//   Tier-1       util > margin_tier1_pct      free spot USDT tops up margin
//   Tier-2       still above tier-1 after     sell a computed spot slice with
//                the top-up                   an equal-notional perp reduction
//
// Tier-2 preserves delta by construction: the spot sale is matched 1:1 in
// notional by a perp-short reduction. Every action appends a record with its
// trigger, inputs, outputs and elapsed time to the rebalance log.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{EngineEvent, EventBus};
use crate::config::SentinelConfig;
use crate::persistence::StateStore;
use crate::portfolio::PortfolioManager;
use crate::types::{dec, dec_f64, now_ms, MarketKind, Side, WalletKind};
use crate::venue::{OrderKind, VenueAdapter, VenueOrderRequest};

/// Which rung of the ladder fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebalanceTier {
    Compounding,
    Tier1,
    Tier2,
}

impl std::fmt::Display for RebalanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compounding => write!(f, "COMPOUNDING"),
            Self::Tier1 => write!(f, "TIER_1"),
            Self::Tier2 => write!(f, "TIER_2"),
        }
    }
}

/// One logged rebalancing action.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceRecord {
    pub at_ms: i64,
    pub trigger: RebalanceTier,
    pub util_before: f64,
    pub util_after: f64,
    pub perp_margin_before: f64,
    pub free_spot_usdt_before: f64,
    pub transferred: f64,
    pub sold_notional: f64,
    pub elapsed_ms: u64,
}

pub struct Rebalancer {
    config: Arc<RwLock<SentinelConfig>>,
    portfolio: Arc<PortfolioManager>,
    venue: Arc<dyn VenueAdapter>,
    bus: EventBus,
    store: Option<Arc<StateStore>>,
}

impl Rebalancer {
    pub fn new(
        config: Arc<RwLock<SentinelConfig>>,
        portfolio: Arc<PortfolioManager>,
        venue: Arc<dyn VenueAdapter>,
        bus: EventBus,
        store: Option<Arc<StateStore>>,
    ) -> Self {
        Self {
            config,
            portfolio,
            venue,
            bus,
            store,
        }
    }

    /// Evaluate the ladder once. Returns the action record when a tier fired.
    pub async fn tick(&self) -> Option<RebalanceRecord> {
        let started = std::time::Instant::now();
        let cfg = self.config.read().clone();

        let util_before = self.portfolio.margin_utilization();
        let wallets = self.portfolio.wallets();
        let margin = dec_f64(wallets.perp_margin);
        let free_usdt = dec_f64(wallets.spot_usdt);
        let used_margin = util_before * margin;

        let tier1 = cfg.margin_tier1_pct / 100.0;
        let compound = cfg.margin_compound_pct / 100.0;
        let target = cfg.margin_target_pct / 100.0;

        let record = if util_before > tier1 {
            self.top_up(cfg, util_before, margin, free_usdt, used_margin, target)
                .await
        } else if util_before < compound && margin > 0.0 {
            self.compound_excess(util_before, margin, free_usdt, used_margin, target)
                .await
        } else {
            return None;
        };

        let mut record = record?;
        record.elapsed_ms = started.elapsed().as_millis() as u64;
        record.at_ms = now_ms();

        if let Some(store) = &self.store {
            if let Err(e) = store.append_rebalance(&record) {
                warn!(error = %e, "failed to persist rebalance record");
            }
        }
        self.bus.publish(EngineEvent::RebalanceExecuted {
            tier: record.trigger.to_string(),
            transferred: record.transferred,
            util_before: record.util_before,
            util_after: record.util_after,
        });
        info!(
            trigger = %record.trigger,
            util_before = record.util_before,
            util_after = record.util_after,
            transferred = record.transferred,
            sold = record.sold_notional,
            "rebalance executed"
        );
        Some(record)
    }

    /// Tier-1 (and Tier-2 if the top-up is not enough).
    async fn top_up(
        &self,
        cfg: SentinelConfig,
        util_before: f64,
        margin: f64,
        free_usdt: f64,
        used_margin: f64,
        target: f64,
    ) -> Option<RebalanceRecord> {
        // Margin needed to land exactly on the target utilization.
        let desired_margin = if target > 0.0 {
            used_margin / target
        } else {
            used_margin
        };
        let transfer = (desired_margin - margin).max(0.0).min(free_usdt);

        if transfer > 0.0 {
            let amount = dec(transfer);
            if let Err(e) = self
                .venue
                .transfer(WalletKind::Spot, WalletKind::PerpMargin, amount)
                .await
            {
                warn!(error = %e, "tier-1 transfer failed at venue");
                return None;
            }
            self.portfolio
                .apply_transfer(WalletKind::Spot, WalletKind::PerpMargin, amount);
        }

        let util_mid = self.portfolio.margin_utilization();
        let tier1 = cfg.margin_tier1_pct / 100.0;
        if util_mid <= tier1 {
            return Some(RebalanceRecord {
                at_ms: 0,
                trigger: RebalanceTier::Tier1,
                util_before,
                util_after: util_mid,
                perp_margin_before: margin,
                free_spot_usdt_before: free_usdt,
                transferred: transfer,
                sold_notional: 0.0,
                elapsed_ms: 0,
            });
        }

        // Tier-2: the top-up was not enough; liquidate a spot slice with an
        // equal-notional perp reduction. Selling S both frees margin
        // (used - S/L) and raises collateral (margin + S):
        //   (used - S/L) / (margin + S) = target
        let margin_now = dec_f64(self.portfolio.wallets().perp_margin);
        let leverage = cfg.max_leverage;
        let denom = target + 1.0 / leverage;
        let slice = ((used_margin - target * margin_now) / denom).max(0.0);
        if slice <= 0.0 {
            return None;
        }

        let mut sold_total = 0.0;
        for position in self.portfolio.positions() {
            if sold_total >= slice {
                break;
            }
            let pair = position.pair.clone();
            let Some(marks) = self.portfolio.marks(&pair) else {
                continue;
            };
            let want = slice - sold_total;
            let Some(sold_qty) = self.portfolio.sell_spot_slice(&pair, want) else {
                continue;
            };
            let sold_notional = sold_qty * marks.spot;
            sold_total += sold_notional;

            // Mirror the accounting on the venue: market-sell the spot slice
            // and buy back the matching perp notional.
            let spec = cfg.pairs.iter().find(|s| s.pair == pair);
            if let Some(spec) = spec {
                let sell_spot = VenueOrderRequest {
                    instrument: spec.spot_instrument.clone(),
                    market: MarketKind::Spot,
                    side: Side::Sell,
                    kind: OrderKind::Market,
                    price: None,
                    qty: sold_qty,
                    client_tag: "rebalance:tier2:spot".to_string(),
                };
                let buy_perp = VenueOrderRequest {
                    instrument: spec.perp_instrument.clone(),
                    market: MarketKind::Perp,
                    side: Side::Buy,
                    kind: OrderKind::Market,
                    price: None,
                    qty: sold_notional / marks.perp,
                    client_tag: "rebalance:tier2:perp".to_string(),
                };
                if let Err(e) = self.venue.place_order(sell_spot).await {
                    warn!(error = %e, "tier-2 spot sale order failed");
                }
                if let Err(e) = self.venue.place_order(buy_perp).await {
                    warn!(error = %e, "tier-2 perp reduction order failed");
                }
            }
        }

        if sold_total <= 0.0 {
            return None;
        }

        // Transfer the sale proceeds into margin.
        let proceeds = dec(sold_total);
        if let Err(e) = self
            .venue
            .transfer(WalletKind::Spot, WalletKind::PerpMargin, proceeds)
            .await
        {
            warn!(error = %e, "tier-2 proceeds transfer failed at venue");
        }
        self.portfolio
            .apply_transfer(WalletKind::Spot, WalletKind::PerpMargin, proceeds);

        Some(RebalanceRecord {
            at_ms: 0,
            trigger: RebalanceTier::Tier2,
            util_before,
            util_after: self.portfolio.margin_utilization(),
            perp_margin_before: margin,
            free_spot_usdt_before: free_usdt,
            transferred: dec_f64(proceeds) + (margin_now - margin),
            sold_notional: sold_total,
            elapsed_ms: 0,
        })
    }

    /// Compounding: utilization is so low that margin sits idle; return the
    /// excess to the spot wallet where the core controller can deploy it.
    async fn compound_excess(
        &self,
        util_before: f64,
        margin: f64,
        free_usdt: f64,
        used_margin: f64,
        target: f64,
    ) -> Option<RebalanceRecord> {
        let desired_margin = if target > 0.0 {
            used_margin / target
        } else {
            0.0
        };
        let excess = (margin - desired_margin).max(0.0);
        if excess <= 0.0 {
            return None;
        }

        let amount = dec(excess);
        if let Err(e) = self
            .venue
            .transfer(WalletKind::PerpMargin, WalletKind::Spot, amount)
            .await
        {
            warn!(error = %e, "compounding transfer failed at venue");
            return None;
        }
        self.portfolio
            .apply_transfer(WalletKind::PerpMargin, WalletKind::Spot, amount);

        Some(RebalanceRecord {
            at_ms: 0,
            trigger: RebalanceTier::Compounding,
            util_before,
            util_after: self.portfolio.margin_utilization(),
            perp_margin_before: margin,
            free_spot_usdt_before: free_usdt,
            transferred: excess,
            sold_notional: 0.0,
            elapsed_ms: 0,
        })
    }
}

impl std::fmt::Debug for Rebalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebalancer")
            .field("venue", &self.venue.id())
            .finish()
    }
}
