// =============================================================================
// Venue adapters: the boundary between the core and exchange plumbing
// =============================================================================
//
// The core consumes venues exclusively through `VenueAdapter`. Adapters own
// their transports (REST, WebSocket) and deliver market data and execution
// events through channels; the core never blocks inside an adapter call
// beyond the await itself. Test doubles substitute at this boundary.
// =============================================================================

pub mod binance;
pub mod paper;
pub mod rate_limit;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::market_data::book::BookSnapshot;
use crate::market_data::liquidation::LiquidationEvent;
use crate::types::{MarketKind, Side, WalletKind};

/// Exchange-level order flavours the executor may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    LimitPostOnly,
    LimitGtc,
    Ioc,
    Market,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LimitPostOnly => write!(f, "LIMIT_POST_ONLY"),
            Self::LimitGtc => write!(f, "LIMIT_GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Market => write!(f, "MARKET"),
        }
    }
}

/// A single order request handed to a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrderRequest {
    pub instrument: String,
    pub market: MarketKind,
    pub side: Side,
    pub kind: OrderKind,
    /// Required for limit kinds, ignored for market.
    pub price: Option<f64>,
    pub qty: f64,
    /// Caller correlation tag (intent id + leg).
    pub client_tag: String,
}

/// Execution lifecycle events flowing back from a venue.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutionEvent {
    Fill {
        leg_order_id: String,
        price: f64,
        qty: f64,
        fee: f64,
        t_exchange: i64,
    },
    Rejected {
        leg_order_id: String,
        reason: String,
    },
    Canceled {
        leg_order_id: String,
    },
    /// IOC/post-only orders that expired without resting or filling.
    Expired {
        leg_order_id: String,
    },
}

impl ExecutionEvent {
    pub fn leg_order_id(&self) -> &str {
        match self {
            Self::Fill { leg_order_id, .. }
            | Self::Rejected { leg_order_id, .. }
            | Self::Canceled { leg_order_id }
            | Self::Expired { leg_order_id } => leg_order_id,
        }
    }
}

/// Wallet balances as reported by a venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletBalances {
    pub spot_usdt: Decimal,
    pub perp_margin: Decimal,
    pub spot_assets: HashMap<String, Decimal>,
}

/// A settled funding cash flow reported by a venue. Positive means the
/// account received funding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub instrument: String,
    pub amount: f64,
    pub at_ms: i64,
}

/// The adapter interface consumed by the core.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Stable venue identifier ("binance", "paper", ...).
    fn id(&self) -> &str;

    /// Subscribe to order-book snapshots for one instrument half.
    async fn subscribe_book(
        &self,
        instrument: &str,
        market: MarketKind,
    ) -> Result<mpsc::Receiver<BookSnapshot>>;

    /// Subscribe to forced-liquidation events for one instrument.
    async fn subscribe_liquidations(
        &self,
        instrument: &str,
    ) -> Result<mpsc::Receiver<LiquidationEvent>>;

    /// Subscribe to the venue-wide execution event stream (fills, rejects,
    /// cancels) for orders placed through this adapter.
    async fn subscribe_execution(&self) -> Result<mpsc::Receiver<ExecutionEvent>>;

    /// Place an order; returns the venue leg-order id.
    async fn place_order(&self, request: VenueOrderRequest) -> Result<String>;

    /// Best-effort cancel.
    async fn cancel_order(&self, instrument: &str, leg_order_id: &str) -> Result<()>;

    async fn wallet_balances(&self) -> Result<WalletBalances>;

    /// Funding cash flows settled on the perp instrument since `since_ms`,
    /// oldest first.
    async fn funding_flows(
        &self,
        instrument: &str,
        since_ms: i64,
    ) -> Result<Vec<FundingPayment>>;

    /// Move collateral between the venue's wallets.
    async fn transfer(&self, from: WalletKind, to: WalletKind, amount: Decimal) -> Result<()>;
}
