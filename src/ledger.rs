// =============================================================================
// Performance Ledger: trade records and derived performance views
// =============================================================================
//
// One Trade per terminated intent. Raw funding cash flows are recorded as
// they arrive; APY and the other performance numbers are computed views over
// the records, never stored. Realized P&L is split into the funding component
// and the basis-scalp component so the two revenue engines can be judged
// separately.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::executor::intent::IntentKind;
use crate::persistence::StateStore;
use crate::router::RouteDecision;
use crate::types::{dec_f64, PairId, Side};

/// Milliseconds per (365-day) year, for funding annualization.
const MS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

/// The reconciled outcome of one terminated intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub intent_id: String,
    pub pair: PairId,
    pub kind: IntentKind,
    /// Spot-leg side of the causing intent.
    pub direction: Side,
    pub open_t_ms: i64,
    pub close_t_ms: Option<i64>,
    pub entry_basis: f64,
    pub exit_basis: Option<f64>,
    /// Executed hedge notional.
    pub notional: f64,
    pub fees_total: Decimal,
    pub funding_attributed: Decimal,
    pub basis_scalp_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub holding_ms: i64,
    pub outcome: String,
    pub route: Option<RouteDecision>,
}

/// A raw funding cash flow, recorded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingFlow {
    pub pair: PairId,
    pub amount: Decimal,
    pub at_ms: i64,
}

/// Computed performance views.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerMetrics {
    pub trade_count: usize,
    pub closed_count: usize,
    pub win_rate: f64,
    pub realized_total: f64,
    pub basis_scalp_total: f64,
    pub funding_total: f64,
    /// Time-weighted funding APY in percent.
    pub funding_apy_pct: f64,
    /// Realized P&L over trades closed in the last 24 h.
    pub pnl_24h: f64,
    /// Per-trade Sharpe ratio (mean return over stddev of returns).
    pub sharpe: f64,
    /// Worst peak-to-trough move of the cumulative realized curve.
    pub max_drawdown: f64,
}

pub struct PerformanceLedger {
    trades: RwLock<Vec<Trade>>,
    funding: RwLock<Vec<FundingFlow>>,
    store: Option<Arc<StateStore>>,
}

impl PerformanceLedger {
    pub fn new(store: Option<Arc<StateStore>>) -> Self {
        Self {
            trades: RwLock::new(Vec::new()),
            funding: RwLock::new(Vec::new()),
            store,
        }
    }

    /// Record a terminated intent's trade. Appends to the persistent trade
    /// log when a store is attached.
    pub fn record(&self, trade: Trade) {
        debug!(
            id = %trade.id,
            intent_id = %trade.intent_id,
            pair = %trade.pair,
            outcome = %trade.outcome,
            realized = %trade.realized_pnl,
            "trade recorded"
        );
        if let Some(store) = &self.store {
            if let Err(e) = store.append_trade(&trade) {
                warn!(error = %e, "failed to persist trade record");
            }
        }
        self.trades.write().push(trade);
    }

    /// Record a raw funding cash flow.
    pub fn record_funding(&self, flow: FundingFlow) {
        self.funding.write().push(flow);
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.read().clone()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.read().len()
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    pub fn metrics(&self, now_ms: i64) -> LedgerMetrics {
        let trades = self.trades.read();
        let funding = self.funding.read();

        let closed: Vec<&Trade> = trades.iter().filter(|t| t.close_t_ms.is_some()).collect();
        let wins = closed
            .iter()
            .filter(|t| t.realized_pnl > Decimal::ZERO)
            .count();
        let win_rate = if closed.is_empty() {
            0.0
        } else {
            wins as f64 / closed.len() as f64
        };

        let realized_total: f64 = closed.iter().map(|t| dec_f64(t.realized_pnl)).sum();
        let basis_scalp_total: f64 = closed.iter().map(|t| dec_f64(t.basis_scalp_pnl)).sum();
        let funding_total: f64 = funding.iter().map(|f| dec_f64(f.amount)).sum();

        // Time-weighted funding APY: funding earned per unit of deployed
        // notional-time, annualized.
        let notional_years: f64 = closed
            .iter()
            .map(|t| t.notional * t.holding_ms as f64 / MS_PER_YEAR)
            .sum();
        let funding_attributed: f64 = closed
            .iter()
            .map(|t| dec_f64(t.funding_attributed))
            .sum();
        let funding_apy_pct = if notional_years > 0.0 {
            funding_attributed / notional_years * 100.0
        } else {
            0.0
        };

        let day_ago = now_ms - 24 * 3600 * 1000;
        let pnl_24h: f64 = closed
            .iter()
            .filter(|t| t.close_t_ms.unwrap_or(0) >= day_ago)
            .map(|t| dec_f64(t.realized_pnl))
            .sum();

        // Per-trade Sharpe over notional-normalized returns.
        let returns: Vec<f64> = closed
            .iter()
            .filter(|t| t.notional > 0.0)
            .map(|t| dec_f64(t.realized_pnl) / t.notional)
            .collect();
        let sharpe = if returns.len() >= 2 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (returns.len() as f64 - 1.0);
            let std = var.sqrt();
            if std > 0.0 {
                mean / std
            } else {
                0.0
            }
        } else {
            0.0
        };

        // Max drawdown of the cumulative realized curve in close order.
        let mut by_close: Vec<&&Trade> = closed.iter().collect();
        by_close.sort_by_key(|t| t.close_t_ms.unwrap_or(0));
        let mut cum = 0.0;
        let mut peak = 0.0f64;
        let mut max_drawdown = 0.0f64;
        for trade in by_close {
            cum += dec_f64(trade.realized_pnl);
            peak = peak.max(cum);
            max_drawdown = max_drawdown.max(peak - cum);
        }

        LedgerMetrics {
            trade_count: trades.len(),
            closed_count: closed.len(),
            win_rate,
            realized_total,
            basis_scalp_total,
            funding_total,
            funding_apy_pct,
            pnl_24h,
            sharpe,
            max_drawdown,
        }
    }

    // -------------------------------------------------------------------------
    // Export
    // -------------------------------------------------------------------------

    /// CSV dump of all trades, header first.
    pub fn export_csv(&self) -> String {
        let mut out = String::from(
            "id,intent_id,pair,kind,direction,open_t,close_t,entry_basis,exit_basis,\
             notional,fees_total,funding_attributed,basis_scalp_pnl,realized_pnl,\
             holding_ms,outcome,venue_spot,venue_perp\n",
        );
        for t in self.trades.read().iter() {
            let (venue_spot, venue_perp) = t
                .route
                .as_ref()
                .map(|r| (r.venue_spot.as_str(), r.venue_perp.as_str()))
                .unwrap_or(("", ""));
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{:.8},{},{:.2},{},{},{},{},{},{},{},{}\n",
                t.id,
                t.intent_id,
                t.pair,
                t.kind,
                t.direction,
                t.open_t_ms,
                t.close_t_ms.map(|v| v.to_string()).unwrap_or_default(),
                t.entry_basis,
                t.exit_basis.map(|v| format!("{v:.8}")).unwrap_or_default(),
                t.notional,
                t.fees_total,
                t.funding_attributed,
                t.basis_scalp_pnl,
                t.realized_pnl,
                t.holding_ms,
                t.outcome,
                venue_spot,
                venue_perp,
            ));
        }
        out
    }

    /// JSON-lines dump of all trades.
    pub fn export_json(&self) -> String {
        self.trades
            .read()
            .iter()
            .filter_map(|t| serde_json::to_string(t).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for PerformanceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceLedger")
            .field("trades", &self.trades.read().len())
            .field("funding_flows", &self.funding.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    fn trade(realized: Decimal, scalp: Decimal, close_t: Option<i64>, holding_ms: i64) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: uuid::Uuid::new_v4().to_string(),
            pair: PairId::new("binance", "BTCUSDT"),
            kind: IntentKind::CloseHedge,
            direction: Side::Sell,
            open_t_ms: 0,
            close_t_ms: close_t,
            entry_basis: 0.0025,
            exit_basis: Some(0.0),
            notional: 2000.0,
            fees_total: d!(1.6),
            funding_attributed: d!(4),
            basis_scalp_pnl: scalp,
            realized_pnl: realized,
            holding_ms,
            outcome: "DONE".to_string(),
            route: None,
        }
    }

    #[test]
    fn win_rate_counts_closed_trades_only() {
        let ledger = PerformanceLedger::new(None);
        ledger.record(trade(d!(5), d!(3), Some(1_000), 1_000));
        ledger.record(trade(d!(-2), d!(-2), Some(2_000), 1_000));
        // Open trade: not counted toward win rate.
        ledger.record(trade(d!(0), d!(0), None, 0));

        let metrics = ledger.metrics(10_000);
        assert_eq!(metrics.trade_count, 3);
        assert_eq!(metrics.closed_count, 2);
        assert!((metrics.win_rate - 0.5).abs() < 1e-12);
        assert!((metrics.realized_total - 3.0).abs() < 1e-9);
        assert!((metrics.basis_scalp_total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn funding_apy_is_time_weighted_view() {
        let ledger = PerformanceLedger::new(None);
        // 2000 notional held for half a year earning 40 in funding:
        // 40 / (2000 * 0.5) = 4% APY.
        let mut t = trade(d!(40), d!(0), Some(1), (MS_PER_YEAR / 2.0) as i64);
        t.funding_attributed = d!(40);
        ledger.record(t);

        let metrics = ledger.metrics(10_000);
        assert!(
            (metrics.funding_apy_pct - 4.0).abs() < 1e-6,
            "got {}",
            metrics.funding_apy_pct
        );
    }

    #[test]
    fn max_drawdown_tracks_peak_to_trough() {
        let ledger = PerformanceLedger::new(None);
        ledger.record(trade(d!(10), d!(10), Some(1_000), 10));
        ledger.record(trade(d!(-4), d!(-4), Some(2_000), 10));
        ledger.record(trade(d!(-3), d!(-3), Some(3_000), 10));
        ledger.record(trade(d!(20), d!(20), Some(4_000), 10));

        let metrics = ledger.metrics(10_000);
        assert!((metrics.max_drawdown - 7.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_24h_filters_by_close_time() {
        let ledger = PerformanceLedger::new(None);
        let now = 100 * 24 * 3600 * 1000i64;
        ledger.record(trade(d!(7), d!(7), Some(now - 3600 * 1000), 10));
        ledger.record(trade(d!(9), d!(9), Some(now - 48 * 3600 * 1000), 10));
        let metrics = ledger.metrics(now);
        assert!((metrics.pnl_24h - 7.0).abs() < 1e-9);
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let ledger = PerformanceLedger::new(None);
        ledger.record(trade(d!(5), d!(3), Some(1_000), 1_000));
        let csv = ledger.export_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,intent_id,pair"));
        assert!(lines[1].contains("binance:BTCUSDT"));
        assert!(lines[1].contains("DONE"));
    }

    #[test]
    fn funding_flows_accumulate() {
        let ledger = PerformanceLedger::new(None);
        ledger.record_funding(FundingFlow {
            pair: PairId::new("binance", "BTCUSDT"),
            amount: d!(1.5),
            at_ms: 1,
        });
        ledger.record_funding(FundingFlow {
            pair: PairId::new("binance", "BTCUSDT"),
            amount: d!(-0.5),
            at_ms: 2,
        });
        let metrics = ledger.metrics(10);
        assert!((metrics.funding_total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn persisted_trades_land_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let ledger = PerformanceLedger::new(Some(store));
        ledger.record(trade(d!(5), d!(3), Some(1_000), 1_000));
        let content = std::fs::read_to_string(dir.path().join("trade_log.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
