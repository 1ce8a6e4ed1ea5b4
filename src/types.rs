// =============================================================================
// Shared types used across the Sentinel trading engine
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lossy f64 -> Decimal conversion for accounting entries derived from
/// venue-reported floats. Non-finite inputs collapse to zero.
pub fn dec(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or_default()
}

/// Decimal -> f64 for ratio math (NAV fractions, utilization).
pub fn dec_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Which half of a spot/perp pair a quote or order refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketKind {
    Spot,
    Perp,
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Perp => write!(f, "perp"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for Buy, -1.0 for Sell.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Role a position plays in the book.
///
/// Core positions implement the standing NAV hedge, satellites are opened
/// opportunistically on z-score triggers, and vacuum positions chase
/// liquidation-driven dislocations toward a convergence target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionKind {
    Core,
    Satellite,
    Vacuum,
}

impl std::fmt::Display for PositionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "CORE"),
            Self::Satellite => write!(f, "SATELLITE"),
            Self::Vacuum => write!(f, "VACUUM"),
        }
    }
}

/// Wallets between which the rebalancer can move collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletKind {
    Spot,
    PerpMargin,
}

impl std::fmt::Display for WalletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::PerpMargin => write!(f, "perp_margin"),
        }
    }
}

/// Whether orders reach a real venue or the in-process paper venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Paper,
    Live,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Market-data health of a pair as judged by the statistical engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairHealth {
    Fresh,
    Unsafe,
}

impl std::fmt::Display for PairHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "Fresh"),
            Self::Unsafe => write!(f, "UNSAFE"),
        }
    }
}

// =============================================================================
// Pair identity & registration
// =============================================================================

/// Identifies one spot/perp instrument pair on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId {
    pub venue: String,
    pub symbol: String,
}

impl PairId {
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for PairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.venue, self.symbol)
    }
}

/// Immutable registration record for a tradable spot/perp pair.
///
/// Registered once at startup from config; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSpec {
    pub pair: PairId,
    /// Venue-level instrument id of the spot leg (e.g. "BTCUSDT").
    pub spot_instrument: String,
    /// Venue-level instrument id of the perp leg.
    pub perp_instrument: String,
    pub tick_size: f64,
    pub lot_size: f64,
    pub fee_maker_bps: f64,
    pub fee_taker_bps: f64,
    pub min_notional: f64,
}

impl PairSpec {
    /// Instrument id for the requested market half.
    pub fn instrument(&self, market: MarketKind) -> &str {
        match market {
            MarketKind::Spot => &self.spot_instrument,
            MarketKind::Perp => &self.perp_instrument,
        }
    }

    /// Round a quantity down to the pair's lot size.
    pub fn round_qty(&self, qty: f64) -> f64 {
        if self.lot_size <= 0.0 {
            return qty;
        }
        (qty / self.lot_size).floor() * self.lot_size
    }

    /// Round a price to the pair's tick size.
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}
