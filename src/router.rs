// =============================================================================
// Cross-Venue Router: cost-aware leg placement
// =============================================================================
//
// For each leg of an intent the router picks the venue minimizing
//
//   cost = taker_fee + expected_impact + transfer_cost + withdrawal_fee
//          - maker_rebate_if_passive
//
// Only venues with fresh books and non-UNSAFE health are eligible. When the
// best cross-venue split saves less than `cross_venue_margin_bps` over the
// best single venue, both legs route to that single venue to eliminate
// transfer latency risk. The decision is a pure function of its inputs; ties
// break on venue id, so identical inputs always produce identical routes.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::PairHealth;

/// Cost inputs for routing one leg on one venue, all in basis points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegQuote {
    pub venue: String,
    pub taker_fee_bps: f64,
    pub expected_impact_bps: f64,
    pub transfer_cost_bps: f64,
    pub withdrawal_fee_bps: f64,
    pub maker_rebate_bps: f64,
    /// Book freshness at quote time.
    pub fresh: bool,
    pub health: PairHealth,
}

impl LegQuote {
    pub fn cost_bps(&self) -> f64 {
        self.taker_fee_bps + self.expected_impact_bps + self.transfer_cost_bps
            + self.withdrawal_fee_bps
            - self.maker_rebate_bps
    }

    fn eligible(&self) -> bool {
        self.fresh && self.health == PairHealth::Fresh
    }
}

/// The routing outcome carried in the intent envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub venue_spot: String,
    pub venue_perp: String,
    pub expected_impact_bps: f64,
    pub single_venue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    NoEligibleVenue,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEligibleVenue => write!(f, "NO_ELIGIBLE_VENUE"),
        }
    }
}

pub struct CrossVenueRouter {
    cross_venue_margin_bps: f64,
}

impl CrossVenueRouter {
    pub fn new(cross_venue_margin_bps: f64) -> Self {
        Self {
            cross_venue_margin_bps,
        }
    }

    /// Pick venues for the spot and perp legs given per-venue quotes.
    pub fn route(
        &self,
        spot_quotes: &[LegQuote],
        perp_quotes: &[LegQuote],
    ) -> Result<RouteDecision, RouteError> {
        let best_spot = Self::best(spot_quotes).ok_or(RouteError::NoEligibleVenue)?;
        let best_perp = Self::best(perp_quotes).ok_or(RouteError::NoEligibleVenue)?;

        let split_cost = best_spot.cost_bps() + best_perp.cost_bps();

        // Cheapest venue that can host both legs, if any.
        let single = Self::best_single(spot_quotes, perp_quotes);

        let decision = match single {
            Some((venue, spot, perp)) if best_spot.venue != best_perp.venue => {
                let single_cost = spot.cost_bps() + perp.cost_bps();
                if single_cost - split_cost < self.cross_venue_margin_bps {
                    RouteDecision {
                        venue_spot: venue.clone(),
                        venue_perp: venue,
                        expected_impact_bps: spot.expected_impact_bps + perp.expected_impact_bps,
                        single_venue: true,
                    }
                } else {
                    RouteDecision {
                        venue_spot: best_spot.venue.clone(),
                        venue_perp: best_perp.venue.clone(),
                        expected_impact_bps: best_spot.expected_impact_bps
                            + best_perp.expected_impact_bps,
                        single_venue: false,
                    }
                }
            }
            _ => RouteDecision {
                venue_spot: best_spot.venue.clone(),
                venue_perp: best_perp.venue.clone(),
                expected_impact_bps: best_spot.expected_impact_bps
                    + best_perp.expected_impact_bps,
                single_venue: best_spot.venue == best_perp.venue,
            },
        };

        debug!(
            venue_spot = %decision.venue_spot,
            venue_perp = %decision.venue_perp,
            single_venue = decision.single_venue,
            impact_bps = decision.expected_impact_bps,
            "route decided"
        );
        Ok(decision)
    }

    /// Cheapest eligible quote; ties break on venue id for determinism.
    fn best(quotes: &[LegQuote]) -> Option<&LegQuote> {
        quotes.iter().filter(|q| q.eligible()).min_by(|a, b| {
            a.cost_bps()
                .partial_cmp(&b.cost_bps())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.venue.cmp(&b.venue))
        })
    }

    /// Cheapest venue offering eligible quotes on both legs.
    fn best_single<'a>(
        spot_quotes: &'a [LegQuote],
        perp_quotes: &'a [LegQuote],
    ) -> Option<(String, &'a LegQuote, &'a LegQuote)> {
        let mut candidates: Vec<(String, &LegQuote, &LegQuote)> = Vec::new();
        for spot in spot_quotes.iter().filter(|q| q.eligible()) {
            if let Some(perp) = perp_quotes
                .iter()
                .filter(|q| q.eligible())
                .find(|q| q.venue == spot.venue)
            {
                candidates.push((spot.venue.clone(), spot, perp));
            }
        }
        candidates.into_iter().min_by(|a, b| {
            let cost_a = a.1.cost_bps() + a.2.cost_bps();
            let cost_b = b.1.cost_bps() + b.2.cost_bps();
            cost_a
                .partial_cmp(&cost_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        })
    }
}

impl std::fmt::Debug for CrossVenueRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossVenueRouter")
            .field("cross_venue_margin_bps", &self.cross_venue_margin_bps)
            .finish()
    }
}
