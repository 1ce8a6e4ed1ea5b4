// =============================================================================
// Portfolio Manager: positions, wallets, NAV, delta, margin utilization
// =============================================================================
//
// The portfolio is the single point of mutation for positions and balances.
// Every method takes the one inner lock, so mutations are serialized; other
// tasks read via cloned snapshots. Cumulative accounting (wallets, fees,
// realized P&L) uses Decimal; ratio math (delta, utilization) converts to
// f64 at the boundary.
//
// Spot legs are carried as wallet assets marked to market, so NAV counts
// unrealized P&L on the perp leg only; the spot leg's drift is already inside
// the asset valuation.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SentinelConfig;
use crate::types::{dec, dec_f64, now_ms, PairId, PositionKind};
use crate::venue::WalletBalances;

/// Latest mark prices for one pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Marks {
    pub spot: f64,
    pub perp: f64,
}

/// One open position. Quantities are signed: positive = long.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub id: String,
    pub pair: PairId,
    pub kind: PositionKind,
    pub spot_qty: f64,
    pub perp_qty: f64,
    pub entry_spot_price: f64,
    pub entry_perp_price: f64,
    pub entry_basis: f64,
    /// Convergence target for vacuum positions.
    #[serde(default)]
    pub target_basis: Option<f64>,
    pub opened_at_ms: i64,
    #[serde(default)]
    pub fees_paid: Decimal,
    #[serde(default)]
    pub funding_paid: Decimal,
}

impl PortfolioPosition {
    /// Hedge notional: the average gross notional of the two legs.
    pub fn notional(&self, marks: &Marks) -> f64 {
        ((self.spot_qty * marks.spot).abs() + (self.perp_qty * marks.perp).abs()) / 2.0
    }

    /// Signed net directional exposure in quote terms.
    pub fn directional_notional(&self, marks: &Marks) -> f64 {
        self.spot_qty * marks.spot + self.perp_qty * marks.perp
    }

    /// Mark-to-market P&L across both legs since entry.
    pub fn unrealized(&self, marks: &Marks) -> f64 {
        self.spot_qty * (marks.spot - self.entry_spot_price)
            + self.perp_qty * (marks.perp - self.entry_perp_price)
    }
}

/// Wallet balances owned by the portfolio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Wallets {
    pub spot_usdt: Decimal,
    pub perp_margin: Decimal,
    /// Spot holdings keyed by pair symbol, in base-asset quantity.
    pub spot_assets: HashMap<String, Decimal>,
}

/// Serialisable snapshot for crash recovery and the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub at_ms: i64,
    pub wallets: Wallets,
    pub positions: Vec<PortfolioPosition>,
}

/// Summary of a position just closed.
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub position: PortfolioPosition,
    pub exit_spot_price: f64,
    pub exit_perp_price: f64,
    pub exit_basis: f64,
    /// Realized P&L across both legs, fees excluded.
    pub realized: Decimal,
}

struct Inner {
    positions: Vec<PortfolioPosition>,
    wallets: Wallets,
    marks: HashMap<PairId, Marks>,
}

pub struct PortfolioManager {
    config: Arc<RwLock<SentinelConfig>>,
    inner: RwLock<Inner>,
}

impl PortfolioManager {
    pub fn new(config: Arc<RwLock<SentinelConfig>>) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                positions: Vec::new(),
                wallets: Wallets::default(),
                marks: HashMap::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Wallets & marks
    // -------------------------------------------------------------------------

    /// Seed wallets from a venue balance report.
    pub fn set_wallets_from(&self, balances: &WalletBalances) {
        let mut inner = self.inner.write();
        inner.wallets.spot_usdt = balances.spot_usdt;
        inner.wallets.perp_margin = balances.perp_margin;
        inner.wallets.spot_assets = balances.spot_assets.clone();
    }

    pub fn wallets(&self) -> Wallets {
        self.inner.read().wallets.clone()
    }

    pub fn update_marks(&self, pair: &PairId, spot: f64, perp: f64) {
        if spot <= 0.0 || perp <= 0.0 {
            return;
        }
        self.inner
            .write()
            .marks
            .insert(pair.clone(), Marks { spot, perp });
    }

    pub fn marks(&self, pair: &PairId) -> Option<Marks> {
        self.inner.read().marks.get(pair).copied()
    }

    /// Mirror a wallet transfer executed on the venue.
    pub fn apply_transfer(
        &self,
        from: crate::types::WalletKind,
        to: crate::types::WalletKind,
        amount: Decimal,
    ) {
        use crate::types::WalletKind;
        let mut inner = self.inner.write();
        match from {
            WalletKind::Spot => inner.wallets.spot_usdt -= amount,
            WalletKind::PerpMargin => inner.wallets.perp_margin -= amount,
        }
        match to {
            WalletKind::Spot => inner.wallets.spot_usdt += amount,
            WalletKind::PerpMargin => inner.wallets.perp_margin += amount,
        }
    }

    /// Credit a funding cash flow to the margin wallet, attributing it to the
    /// pair's open perp-bearing position when one exists.
    pub fn apply_funding(&self, pair: &PairId, amount: Decimal) {
        let mut inner = self.inner.write();
        inner.wallets.perp_margin += amount;
        if let Some(pos) = inner
            .positions
            .iter_mut()
            .find(|p| &p.pair == pair && p.perp_qty != 0.0)
        {
            pos.funding_paid += amount;
        }
    }

    // -------------------------------------------------------------------------
    // Position lifecycle
    // -------------------------------------------------------------------------

    /// Open a position from reconciled fills. Wallet effects: the spot leg
    /// moves USDT against base-asset holdings; fees debit their leg's wallet.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &self,
        pair: &PairId,
        kind: PositionKind,
        spot_qty: f64,
        perp_qty: f64,
        entry_spot_price: f64,
        entry_perp_price: f64,
        entry_basis: f64,
        target_basis: Option<f64>,
        spot_fee: Decimal,
        perp_fee: Decimal,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.inner.write();

        let spot_cost = dec(spot_qty * entry_spot_price);
        inner.wallets.spot_usdt -= spot_cost + spot_fee;
        inner.wallets.perp_margin -= perp_fee;
        *inner
            .wallets
            .spot_assets
            .entry(pair.symbol.clone())
            .or_default() += dec(spot_qty);

        inner.positions.push(PortfolioPosition {
            id: id.clone(),
            pair: pair.clone(),
            kind,
            spot_qty,
            perp_qty,
            entry_spot_price,
            entry_perp_price,
            entry_basis,
            target_basis,
            opened_at_ms: now_ms(),
            fees_paid: spot_fee + perp_fee,
            funding_paid: Decimal::ZERO,
        });

        info!(
            id = %id,
            pair = %pair,
            kind = %kind,
            spot_qty,
            perp_qty,
            entry_basis,
            "position opened"
        );
        id
    }

    /// Close a position at the given exit prices, realizing both legs into
    /// the wallets. Returns `None` when the id does not match.
    pub fn close_position(
        &self,
        position_id: &str,
        exit_spot_price: f64,
        exit_perp_price: f64,
        exit_basis: f64,
        spot_fee: Decimal,
        perp_fee: Decimal,
    ) -> Option<ClosedPosition> {
        let mut inner = self.inner.write();
        let idx = inner.positions.iter().position(|p| p.id == position_id)?;
        let mut position = inner.positions.remove(idx);
        position.fees_paid += spot_fee + perp_fee;

        // Unwind the spot leg into USDT.
        let spot_proceeds = dec(position.spot_qty * exit_spot_price);
        inner.wallets.spot_usdt += spot_proceeds - spot_fee;
        if let Some(held) = inner.wallets.spot_assets.get_mut(&position.pair.symbol) {
            *held -= dec(position.spot_qty);
        }

        // Realize the perp leg into margin.
        let perp_pnl = dec(position.perp_qty * (exit_perp_price - position.entry_perp_price));
        inner.wallets.perp_margin += perp_pnl - perp_fee;

        let spot_pnl = dec(position.spot_qty * (exit_spot_price - position.entry_spot_price));
        let realized = spot_pnl + perp_pnl;

        info!(
            id = %position.id,
            pair = %position.pair,
            kind = %position.kind,
            exit_basis,
            realized = %realized,
            "position closed"
        );

        Some(ClosedPosition {
            position,
            exit_spot_price,
            exit_perp_price,
            exit_basis,
            realized,
        })
    }

    /// Partially unwind a position: `close_qty` base units come off both legs
    /// at the given exit prices. Returns the realized P&L of the closed
    /// fraction. Quantities at or beyond the position size close it fully.
    pub fn reduce_position(
        &self,
        position_id: &str,
        close_qty: f64,
        exit_spot_price: f64,
        exit_perp_price: f64,
        exit_basis: f64,
        spot_fee: Decimal,
        perp_fee: Decimal,
    ) -> Option<Decimal> {
        let full = {
            let inner = self.inner.read();
            let position = inner.positions.iter().find(|p| p.id == position_id)?;
            close_qty >= position.spot_qty.abs() - 1e-9
        };
        if full {
            return self
                .close_position(
                    position_id,
                    exit_spot_price,
                    exit_perp_price,
                    exit_basis,
                    spot_fee,
                    perp_fee,
                )
                .map(|closed| closed.realized);
        }

        let mut inner = self.inner.write();
        let position = inner
            .positions
            .iter_mut()
            .find(|p| p.id == position_id)?;

        let spot_sign = position.spot_qty.signum();
        let perp_sign = position.perp_qty.signum();
        let spot_closed = close_qty * spot_sign;
        let perp_closed = close_qty * perp_sign;
        position.spot_qty -= spot_closed;
        position.perp_qty -= perp_closed;
        position.fees_paid += spot_fee + perp_fee;

        let spot_pnl = dec(spot_closed * (exit_spot_price - position.entry_spot_price));
        let perp_pnl = dec(perp_closed * (exit_perp_price - position.entry_perp_price));
        let pair_symbol = position.pair.symbol.clone();
        let position_id = position.id.clone();

        let proceeds = dec(spot_closed * exit_spot_price);
        inner.wallets.spot_usdt += proceeds - spot_fee;
        if let Some(held) = inner.wallets.spot_assets.get_mut(&pair_symbol) {
            *held -= dec(spot_closed);
        }
        inner.wallets.perp_margin += perp_pnl - perp_fee;

        info!(
            id = %position_id,
            close_qty,
            exit_basis,
            "position partially reduced"
        );
        Some(spot_pnl + perp_pnl)
    }

    /// Tier-2 rebalancing: sell `notional` of the pair's spot leg and reduce
    /// the perp leg by the same notional so delta is preserved. Returns the
    /// sold spot quantity, or `None` when no position or marks exist.
    pub fn sell_spot_slice(&self, pair: &PairId, notional: f64) -> Option<f64> {
        let mut inner = self.inner.write();
        let marks = *inner.marks.get(pair)?;
        if marks.spot <= 0.0 || marks.perp <= 0.0 {
            return None;
        }

        let position = inner
            .positions
            .iter_mut()
            .find(|p| &p.pair == pair && p.kind != PositionKind::Vacuum && p.spot_qty > 0.0)?;

        let sell_qty = (notional / marks.spot).min(position.spot_qty);
        let reduce_perp = (notional / marks.perp).min(position.perp_qty.abs());
        position.spot_qty -= sell_qty;
        // Shorts are negative; reducing the hedge moves the qty toward zero.
        position.perp_qty -= reduce_perp * position.perp_qty.signum();

        let proceeds = dec(sell_qty * marks.spot);
        inner.wallets.spot_usdt += proceeds;
        if let Some(held) = inner.wallets.spot_assets.get_mut(&pair.symbol) {
            *held -= dec(sell_qty);
        }

        warn!(
            pair = %pair,
            sold_qty = sell_qty,
            notional,
            "tier-2 spot slice sold with matching perp reduction"
        );
        Some(sell_qty)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn positions(&self) -> Vec<PortfolioPosition> {
        self.inner.read().positions.clone()
    }

    pub fn position(&self, pair: &PairId, kind: PositionKind) -> Option<PortfolioPosition> {
        self.inner
            .read()
            .positions
            .iter()
            .find(|p| &p.pair == pair && p.kind == kind)
            .cloned()
    }

    pub fn has_position(&self, pair: &PairId, kind: PositionKind) -> bool {
        self.position(pair, kind).is_some()
    }

    /// Net asset value: wallets plus marked spot holdings plus unrealized
    /// perp P&L.
    pub fn nav(&self) -> f64 {
        let inner = self.inner.read();
        let mut nav = dec_f64(inner.wallets.spot_usdt) + dec_f64(inner.wallets.perp_margin);

        for (symbol, qty) in &inner.wallets.spot_assets {
            let mark = inner
                .marks
                .iter()
                .find(|(pair, _)| &pair.symbol == symbol)
                .map(|(_, m)| m.spot)
                .unwrap_or(0.0);
            nav += dec_f64(*qty) * mark;
        }

        for position in &inner.positions {
            if let Some(marks) = inner.marks.get(&position.pair) {
                nav += position.perp_qty * (marks.perp - position.entry_perp_price);
            }
        }
        nav
    }

    /// Signed net directional exposure as a fraction of NAV. Vacuum positions
    /// are excluded when `vacuum_counts_toward_delta` is off.
    pub fn delta(&self) -> f64 {
        let count_vacuum = self.config.read().vacuum_counts_toward_delta;
        let nav = self.nav();
        if nav <= 0.0 {
            return 0.0;
        }
        let inner = self.inner.read();
        let directional: f64 = inner
            .positions
            .iter()
            .filter(|p| count_vacuum || p.kind != PositionKind::Vacuum)
            .filter_map(|p| inner.marks.get(&p.pair).map(|m| p.directional_notional(m)))
            .sum();
        directional / nav
    }

    /// Used margin over the margin wallet. Used margin assumes positions are
    /// carried at the configured maximum leverage.
    pub fn margin_utilization(&self) -> f64 {
        let max_leverage = self.config.read().max_leverage;
        let inner = self.inner.read();
        let used: f64 = inner
            .positions
            .iter()
            .filter_map(|p| {
                inner
                    .marks
                    .get(&p.pair)
                    .map(|m| (p.perp_qty * m.perp).abs() / max_leverage)
            })
            .sum();
        let margin = dec_f64(inner.wallets.perp_margin);
        if margin <= 0.0 {
            if used > 0.0 {
                return f64::INFINITY;
            }
            return 0.0;
        }
        used / margin
    }

    /// Gross hedge notional held by positions of `kind`.
    pub fn notional_of_kind(&self, kind: PositionKind) -> f64 {
        let inner = self.inner.read();
        inner
            .positions
            .iter()
            .filter(|p| p.kind == kind)
            .filter_map(|p| inner.marks.get(&p.pair).map(|m| p.notional(m)))
            .sum()
    }

    /// Gross hedge notional across all positions of a pair.
    pub fn pair_notional(&self, pair: &PairId) -> f64 {
        let inner = self.inner.read();
        inner
            .positions
            .iter()
            .filter(|p| &p.pair == pair)
            .filter_map(|p| inner.marks.get(&p.pair).map(|m| p.notional(m)))
            .sum()
    }

    pub fn aggregate_notional(&self) -> f64 {
        let inner = self.inner.read();
        inner
            .positions
            .iter()
            .filter_map(|p| inner.marks.get(&p.pair).map(|m| p.notional(m)))
            .sum()
    }

    /// Per-position delta-tolerance check for non-vacuum positions. Returns
    /// human-readable violation descriptions; empty means healthy.
    pub fn invariant_violations(&self) -> Vec<String> {
        let tolerance = self.config.read().delta_tolerance_notional;
        let inner = self.inner.read();
        inner
            .positions
            .iter()
            .filter(|p| p.kind != PositionKind::Vacuum)
            .filter_map(|p| {
                let marks = inner.marks.get(&p.pair)?;
                let imbalance = p.directional_notional(marks).abs();
                if imbalance > tolerance {
                    Some(format!(
                        "position {} ({}) imbalance {:.2} exceeds tolerance {:.2}",
                        p.id, p.pair, imbalance, tolerance
                    ))
                } else {
                    None
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> PortfolioSnapshot {
        let inner = self.inner.read();
        PortfolioSnapshot {
            at_ms: now_ms(),
            wallets: inner.wallets.clone(),
            positions: inner.positions.clone(),
        }
    }

    pub fn restore(&self, snapshot: PortfolioSnapshot) {
        let mut inner = self.inner.write();
        inner.wallets = snapshot.wallets;
        inner.positions = snapshot.positions;
        debug!(positions = inner.positions.len(), "portfolio state restored");
    }
}

impl std::fmt::Debug for PortfolioManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PortfolioManager")
            .field("positions", &inner.positions.len())
            .field("spot_usdt", &inner.wallets.spot_usdt)
            .field("perp_margin", &inner.wallets.perp_margin)
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

    fn manager_with_wallets(spot_usdt: f64, perp_margin: f64) -> PortfolioManager {
        let config = Arc::new(RwLock::new(SentinelConfig::default()));
        let manager = PortfolioManager::new(config);
        manager.set_wallets_from(&WalletBalances {
            spot_usdt: dec(spot_usdt),
            perp_margin: dec(perp_margin),
            spot_assets: HashMap::new(),
        });
        manager
    }

    fn pair() -> PairId {
        PairId::new("binance", "BTCUSDT")
    }

    #[test]
    fn open_hedge_keeps_nav_flat_minus_fees() {
        let manager = manager_with_wallets(10_000.0, 5_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        let nav_before = manager.nav();

        manager.open_position(
            &pair(),
            PositionKind::Satellite,
            10.0,
            -10.0,
            100.0,
            100.0,
            0.0,
            None,
            d!(1),
            d!(1),
        );

        let nav_after = manager.nav();
        assert!(
            (nav_before - nav_after - 2.0).abs() < 1e-6,
            "NAV should drop by fees only: before {nav_before}, after {nav_after}"
        );
    }

    #[test]
    fn delta_is_zero_for_balanced_hedge() {
        let manager = manager_with_wallets(10_000.0, 5_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        manager.open_position(
            &pair(),
            PositionKind::Satellite,
            10.0,
            -10.0,
            100.0,
            100.0,
            0.001,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert!(manager.delta().abs() < 1e-9);
    }

    #[test]
    fn vacuum_delta_respects_config_flag() {
        let config = Arc::new(RwLock::new(SentinelConfig::default()));
        let manager = PortfolioManager::new(config.clone());
        manager.set_wallets_from(&WalletBalances {
            spot_usdt: d!(10_000),
            perp_margin: d!(5_000),
            spot_assets: HashMap::new(),
        });
        manager.update_marks(&pair(), 100.0, 100.0);
        // Vacuum long perp with no spot hedge: pure directional exposure.
        manager.open_position(
            &pair(),
            PositionKind::Vacuum,
            0.0,
            10.0,
            100.0,
            100.0,
            -0.008,
            Some(0.0),
            Decimal::ZERO,
            Decimal::ZERO,
        );

        assert!(manager.delta() > 0.0);
        config.write().vacuum_counts_toward_delta = false;
        assert!(manager.delta().abs() < 1e-12);
    }

    #[test]
    fn close_realizes_basis_scalp() {
        let manager = manager_with_wallets(10_000.0, 5_000.0);
        manager.update_marks(&pair(), 100.0, 100.25);
        // Entered long spot at 100, short perp at 100.25 (basis +25 bps).
        let id = manager.open_position(
            &pair(),
            PositionKind::Satellite,
            10.0,
            -10.0,
            100.0,
            100.25,
            0.0025,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );

        // Basis converged to zero at 100/100.
        let closed = manager
            .close_position(&id, 100.0, 100.0, 0.0, Decimal::ZERO, Decimal::ZERO)
            .unwrap();

        // Scalp: spot leg flat, perp short gains 0.25 * 10.
        assert_eq!(closed.realized, d!(2.5));
        assert!(manager.positions().is_empty());
    }

    #[test]
    fn margin_utilization_uses_leverage() {
        let manager = manager_with_wallets(10_000.0, 1_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        // 10 perp short at 100 = 1000 notional; at 5x leverage = 200 used.
        manager.open_position(
            &pair(),
            PositionKind::Core,
            10.0,
            -10.0,
            100.0,
            100.0,
            0.0,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        let util = manager.margin_utilization();
        assert!((util - 0.2).abs() < 1e-9, "expected 20% util, got {util}");
    }

    #[test]
    fn invariant_flags_unbalanced_position() {
        let manager = manager_with_wallets(10_000.0, 5_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        manager.open_position(
            &pair(),
            PositionKind::Satellite,
            10.0,
            -4.0, // badly unbalanced
            100.0,
            100.0,
            0.0,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        let violations = manager.invariant_violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("imbalance"));
    }

    #[test]
    fn sell_spot_slice_preserves_delta() {
        let manager = manager_with_wallets(0.0, 1_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        manager.open_position(
            &pair(),
            PositionKind::Core,
            50.0,
            -50.0,
            100.0,
            100.0,
            0.0,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        let delta_before = manager.delta();

        let sold = manager.sell_spot_slice(&pair(), 1_000.0).unwrap();
        assert!((sold - 10.0).abs() < 1e-9);

        let position = manager.position(&pair(), PositionKind::Core).unwrap();
        assert!((position.spot_qty - 40.0).abs() < 1e-9);
        assert!((position.perp_qty + 40.0).abs() < 1e-9);
        assert!((manager.delta() - delta_before).abs() < 1e-9);
        assert_eq!(manager.wallets().spot_usdt, d!(1000));
    }

    #[test]
    fn snapshot_roundtrip() {
        let manager = manager_with_wallets(10_000.0, 5_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        manager.open_position(
            &pair(),
            PositionKind::Core,
            5.0,
            -5.0,
            100.0,
            100.0,
            0.0,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );

        let snapshot = manager.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: PortfolioSnapshot = serde_json::from_str(&json).unwrap();

        let manager2 = manager_with_wallets(0.0, 0.0);
        manager2.restore(restored);
        assert_eq!(manager2.positions().len(), 1);
        assert_eq!(manager2.wallets().spot_usdt, manager.wallets().spot_usdt);
    }

    #[test]
    fn funding_credits_margin_and_position() {
        let manager = manager_with_wallets(0.0, 1_000.0);
        manager.update_marks(&pair(), 100.0, 100.0);
        manager.open_position(
            &pair(),
            PositionKind::Core,
            10.0,
            -10.0,
            100.0,
            100.0,
            0.0,
            None,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        manager.apply_funding(&pair(), d!(12.5));
        assert_eq!(manager.wallets().perp_margin, d!(1012.5));
        let position = manager.position(&pair(), PositionKind::Core).unwrap();
        assert_eq!(position.funding_paid, d!(12.5));
    }
}
