// =============================================================================
// Paper venue: in-process simulated exchange
// =============================================================================
//
// Fills are synthesized from per-instrument scripts so demo mode and tests
// get deterministic execution without touching a network. Orders resolve
// after a short synthetic latency on a spawned task, mirroring how a real
// venue delivers fills asynchronously on the execution stream.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::market_data::book::BookSnapshot;
use crate::market_data::liquidation::LiquidationEvent;
use crate::types::{MarketKind, WalletKind};
use crate::venue::{
    ExecutionEvent, FundingPayment, OrderKind, VenueAdapter, VenueOrderRequest, WalletBalances,
};

/// What happens to the remainder of a partially filled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainderOutcome {
    Reject,
    Cancel,
    Expire,
}

/// Scripted execution behavior for an instrument.
#[derive(Debug, Clone)]
pub enum OrderBehavior {
    /// Fill the full quantity, slipping adversely by `slippage_bps`.
    FillFull { slippage_bps: f64 },
    /// Fill `fraction` of the quantity, then resolve the remainder.
    FillPartial {
        fraction: f64,
        slippage_bps: f64,
        remainder: RemainderOutcome,
    },
    /// Reject the order outright.
    Reject { reason: String },
    /// Accept and never respond; the order rests until canceled.
    Silent,
}

impl Default for OrderBehavior {
    fn default() -> Self {
        Self::FillFull { slippage_bps: 0.0 }
    }
}

#[derive(Debug, Clone)]
struct OpenOrder {
    instrument: String,
}

struct PaperShared {
    id: String,
    latency: Duration,
    fee_bps: f64,
    behaviors: RwLock<HashMap<String, OrderBehavior>>,
    marks: RwLock<HashMap<(String, MarketKind), f64>>,
    balances: RwLock<WalletBalances>,
    funding: RwLock<Vec<FundingPayment>>,
    open_orders: RwLock<HashMap<String, OpenOrder>>,
    exec_txs: RwLock<Vec<mpsc::Sender<ExecutionEvent>>>,
    book_txs: RwLock<HashMap<(String, MarketKind), Vec<mpsc::Sender<BookSnapshot>>>>,
    liq_txs: RwLock<HashMap<String, Vec<mpsc::Sender<LiquidationEvent>>>>,
}

impl PaperShared {
    fn broadcast_exec(&self, event: ExecutionEvent) {
        let txs = self.exec_txs.read();
        for tx in txs.iter() {
            let _ = tx.try_send(event.clone());
        }
    }
}

/// The simulated venue handle. Cloning shares the underlying state.
#[derive(Clone)]
pub struct PaperVenue {
    shared: Arc<PaperShared>,
}

impl PaperVenue {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(PaperShared {
                id: id.into(),
                latency: Duration::from_millis(1),
                fee_bps: 4.0,
                behaviors: RwLock::new(HashMap::new()),
                marks: RwLock::new(HashMap::new()),
                balances: RwLock::new(WalletBalances::default()),
                funding: RwLock::new(Vec::new()),
                open_orders: RwLock::new(HashMap::new()),
                exec_txs: RwLock::new(Vec::new()),
                book_txs: RwLock::new(HashMap::new()),
                liq_txs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Script the execution behavior for one instrument.
    pub fn set_behavior(&self, instrument: &str, behavior: OrderBehavior) {
        self.shared
            .behaviors
            .write()
            .insert(instrument.to_string(), behavior);
    }

    /// Set the mark price used when an order carries no limit price.
    pub fn set_mark(&self, instrument: &str, market: MarketKind, price: f64) {
        self.shared
            .marks
            .write()
            .insert((instrument.to_string(), market), price);
    }

    pub fn set_balances(&self, balances: WalletBalances) {
        *self.shared.balances.write() = balances;
    }

    /// Feed a book snapshot to all subscribers of (instrument, market).
    pub fn push_book(&self, instrument: &str, market: MarketKind, snapshot: BookSnapshot) {
        let txs = self.shared.book_txs.read();
        if let Some(list) = txs.get(&(instrument.to_string(), market)) {
            for tx in list {
                let _ = tx.try_send(snapshot.clone());
            }
        }
    }

    /// Feed a liquidation event to all subscribers of the instrument.
    pub fn push_liquidation(&self, instrument: &str, event: LiquidationEvent) {
        let txs = self.shared.liq_txs.read();
        if let Some(list) = txs.get(instrument) {
            for tx in list {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    pub fn open_order_count(&self) -> usize {
        self.shared.open_orders.read().len()
    }

    /// Script a funding payment for `funding_flows` to report.
    pub fn push_funding(&self, payment: FundingPayment) {
        self.shared.funding.write().push(payment);
    }

    fn resolve_price(&self, request: &VenueOrderRequest) -> f64 {
        request.price.unwrap_or_else(|| {
            self.shared
                .marks
                .read()
                .get(&(request.instrument.clone(), request.market))
                .copied()
                .unwrap_or(0.0)
        })
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn id(&self) -> &str {
        &self.shared.id
    }

    async fn subscribe_book(
        &self,
        instrument: &str,
        market: MarketKind,
    ) -> Result<mpsc::Receiver<BookSnapshot>> {
        let (tx, rx) = mpsc::channel(64);
        self.shared
            .book_txs
            .write()
            .entry((instrument.to_string(), market))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_liquidations(
        &self,
        instrument: &str,
    ) -> Result<mpsc::Receiver<LiquidationEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.shared
            .liq_txs
            .write()
            .entry(instrument.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_execution(&self) -> Result<mpsc::Receiver<ExecutionEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.shared.exec_txs.write().push(tx);
        Ok(rx)
    }

    async fn place_order(&self, request: VenueOrderRequest) -> Result<String> {
        if matches!(request.kind, OrderKind::LimitPostOnly | OrderKind::LimitGtc)
            && request.price.is_none()
        {
            anyhow::bail!("limit order without a price");
        }
        if request.qty <= 0.0 {
            anyhow::bail!("non-positive order quantity");
        }

        let leg_order_id = Uuid::new_v4().to_string();
        let behavior = self
            .shared
            .behaviors
            .read()
            .get(&request.instrument)
            .cloned()
            .unwrap_or_default();

        self.shared.open_orders.write().insert(
            leg_order_id.clone(),
            OpenOrder {
                instrument: request.instrument.clone(),
            },
        );

        debug!(
            venue = %self.shared.id,
            instrument = %request.instrument,
            side = %request.side,
            qty = request.qty,
            kind = %request.kind,
            leg_order_id = %leg_order_id,
            "paper order accepted"
        );

        let base_price = self.resolve_price(&request);
        let shared = self.shared.clone();
        let id = leg_order_id.clone();
        let fee_bps = self.shared.fee_bps;
        tokio::spawn(async move {
            tokio::time::sleep(shared.latency).await;

            // Canceled while "in flight".
            if !shared.open_orders.read().contains_key(&id) {
                return;
            }

            let adverse = |slippage_bps: f64| {
                base_price * (1.0 + request.side.sign() * slippage_bps / 10_000.0)
            };
            let fee_for = |price: f64, qty: f64| price * qty * fee_bps / 10_000.0;
            let t_exchange = crate::types::now_ms();

            match behavior {
                OrderBehavior::FillFull { slippage_bps } => {
                    let price = adverse(slippage_bps);
                    shared.broadcast_exec(ExecutionEvent::Fill {
                        leg_order_id: id.clone(),
                        price,
                        qty: request.qty,
                        fee: fee_for(price, request.qty),
                        t_exchange,
                    });
                    shared.open_orders.write().remove(&id);
                }
                OrderBehavior::FillPartial {
                    fraction,
                    slippage_bps,
                    remainder,
                } => {
                    let price = adverse(slippage_bps);
                    let filled = request.qty * fraction.clamp(0.0, 1.0);
                    if filled > 0.0 {
                        shared.broadcast_exec(ExecutionEvent::Fill {
                            leg_order_id: id.clone(),
                            price,
                            qty: filled,
                            fee: fee_for(price, filled),
                            t_exchange,
                        });
                    }
                    let event = match remainder {
                        RemainderOutcome::Reject => ExecutionEvent::Rejected {
                            leg_order_id: id.clone(),
                            reason: "remainder rejected".to_string(),
                        },
                        RemainderOutcome::Cancel => ExecutionEvent::Canceled {
                            leg_order_id: id.clone(),
                        },
                        RemainderOutcome::Expire => ExecutionEvent::Expired {
                            leg_order_id: id.clone(),
                        },
                    };
                    shared.broadcast_exec(event);
                    shared.open_orders.write().remove(&id);
                }
                OrderBehavior::Reject { reason } => {
                    shared.broadcast_exec(ExecutionEvent::Rejected {
                        leg_order_id: id.clone(),
                        reason,
                    });
                    shared.open_orders.write().remove(&id);
                }
                OrderBehavior::Silent => {
                    // Order rests until canceled.
                }
            }
        });

        Ok(leg_order_id)
    }

    async fn cancel_order(&self, _instrument: &str, leg_order_id: &str) -> Result<()> {
        let removed = self.shared.open_orders.write().remove(leg_order_id);
        match removed {
            Some(order) => {
                debug!(leg_order_id, instrument = %order.instrument, "paper order canceled");
                self.shared.broadcast_exec(ExecutionEvent::Canceled {
                    leg_order_id: leg_order_id.to_string(),
                });
            }
            None => warn!(leg_order_id, "cancel for unknown or resolved paper order"),
        }
        Ok(())
    }

    async fn wallet_balances(&self) -> Result<WalletBalances> {
        Ok(self.shared.balances.read().clone())
    }

    async fn funding_flows(
        &self,
        instrument: &str,
        since_ms: i64,
    ) -> Result<Vec<FundingPayment>> {
        Ok(self
            .shared
            .funding
            .read()
            .iter()
            .filter(|p| p.instrument == instrument && p.at_ms > since_ms)
            .cloned()
            .collect())
    }

    async fn transfer(&self, from: WalletKind, to: WalletKind, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            anyhow::bail!("transfer amount must be positive");
        }
        let mut balances = self.shared.balances.write();
        let source = match from {
            WalletKind::Spot => &mut balances.spot_usdt,
            WalletKind::PerpMargin => &mut balances.perp_margin,
        };
        if *source < amount {
            anyhow::bail!("insufficient balance in {from} wallet");
        }
        *source -= amount;
        let dest = match to {
            WalletKind::Spot => &mut balances.spot_usdt,
            WalletKind::PerpMargin => &mut balances.perp_margin,
        };
        *dest += amount;
        debug!(%from, %to, %amount, "paper transfer applied");
        Ok(())
    }
}

impl std::fmt::Debug for PaperVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperVenue")
            .field("id", &self.shared.id)
            .field("open_orders", &self.shared.open_orders.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn request(instrument: &str, side: Side, qty: f64, price: Option<f64>) -> VenueOrderRequest {
        VenueOrderRequest {
            instrument: instrument.to_string(),
            market: MarketKind::Spot,
            side,
            kind: if price.is_some() {
                OrderKind::LimitGtc
            } else {
                OrderKind::Market
            },
            price,
            qty,
            client_tag: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn full_fill_arrives_on_execution_stream() {
        let venue = PaperVenue::new("paper");
        let mut exec = venue.subscribe_execution().await.unwrap();
        let id = venue
            .place_order(request("BTCUSDT", Side::Buy, 1.0, Some(100.0)))
            .await
            .unwrap();

        match exec.recv().await.unwrap() {
            ExecutionEvent::Fill {
                leg_order_id,
                price,
                qty,
                ..
            } => {
                assert_eq!(leg_order_id, id);
                assert!((price - 100.0).abs() < 1e-9);
                assert!((qty - 1.0).abs() < 1e-12);
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(venue.open_order_count(), 0);
    }

    #[tokio::test]
    async fn partial_then_reject_script() {
        let venue = PaperVenue::new("paper");
        venue.set_behavior(
            "BTCUSDT",
            OrderBehavior::FillPartial {
                fraction: 0.5,
                slippage_bps: 0.0,
                remainder: RemainderOutcome::Reject,
            },
        );
        let mut exec = venue.subscribe_execution().await.unwrap();
        venue
            .place_order(request("BTCUSDT", Side::Buy, 2.0, Some(100.0)))
            .await
            .unwrap();

        match exec.recv().await.unwrap() {
            ExecutionEvent::Fill { qty, .. } => assert!((qty - 1.0).abs() < 1e-12),
            other => panic!("expected fill, got {other:?}"),
        }
        assert!(matches!(
            exec.recv().await.unwrap(),
            ExecutionEvent::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn slippage_is_adverse_for_both_sides() {
        let venue = PaperVenue::new("paper");
        venue.set_behavior("BTCUSDT", OrderBehavior::FillFull { slippage_bps: 10.0 });
        let mut exec = venue.subscribe_execution().await.unwrap();

        venue
            .place_order(request("BTCUSDT", Side::Buy, 1.0, Some(100.0)))
            .await
            .unwrap();
        let buy_price = match exec.recv().await.unwrap() {
            ExecutionEvent::Fill { price, .. } => price,
            other => panic!("{other:?}"),
        };
        assert!(buy_price > 100.0);

        venue
            .place_order(request("BTCUSDT", Side::Sell, 1.0, Some(100.0)))
            .await
            .unwrap();
        let sell_price = match exec.recv().await.unwrap() {
            ExecutionEvent::Fill { price, .. } => price,
            other => panic!("{other:?}"),
        };
        assert!(sell_price < 100.0);
    }

    #[tokio::test]
    async fn silent_orders_rest_until_canceled() {
        let venue = PaperVenue::new("paper");
        venue.set_behavior("BTCUSDT", OrderBehavior::Silent);
        let mut exec = venue.subscribe_execution().await.unwrap();
        let id = venue
            .place_order(request("BTCUSDT", Side::Buy, 1.0, Some(100.0)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(venue.open_order_count(), 1);

        venue.cancel_order("BTCUSDT", &id).await.unwrap();
        assert!(matches!(
            exec.recv().await.unwrap(),
            ExecutionEvent::Canceled { .. }
        ));
        assert_eq!(venue.open_order_count(), 0);
    }

    #[tokio::test]
    async fn market_order_uses_mark_price() {
        let venue = PaperVenue::new("paper");
        venue.set_mark("BTCUSDT", MarketKind::Spot, 250.0);
        let mut exec = venue.subscribe_execution().await.unwrap();
        venue
            .place_order(request("BTCUSDT", Side::Buy, 1.0, None))
            .await
            .unwrap();
        match exec.recv().await.unwrap() {
            ExecutionEvent::Fill { price, .. } => assert!((price - 250.0).abs() < 1e-9),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn transfers_move_collateral_between_wallets() {
        let venue = PaperVenue::new("paper");
        venue.set_balances(WalletBalances {
            spot_usdt: dec!(1000),
            perp_margin: dec!(100),
            spot_assets: HashMap::new(),
        });

        venue
            .transfer(WalletKind::Spot, WalletKind::PerpMargin, dec!(400))
            .await
            .unwrap();
        let balances = venue.wallet_balances().await.unwrap();
        assert_eq!(balances.spot_usdt, dec!(600));
        assert_eq!(balances.perp_margin, dec!(500));

        // Overdraft refused.
        assert!(venue
            .transfer(WalletKind::PerpMargin, WalletKind::Spot, dec!(10_000))
            .await
            .is_err());
    }
}
