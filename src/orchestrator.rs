// =============================================================================
// Orchestrator: wiring, long-lived tasks, cancellation
// =============================================================================
//
// Owns the spawn points for every long-lived task:
//
//   - per (venue, pair, market) book pumps into bounded drop-oldest queues
//   - one statistics task per pair (single consumer, in-order)
//   - per-pair liquidation pumps into the vacuum detector
//   - per-venue execution pumps into the executor
//   - the signal tick, risk monitor, rebalancer and persistence timers
//   - the read-only API server
//
// Shutdown rides one watch channel; every task selects on it. Intents already
// in compensation finish regardless (the executor ignores caller cancel
// there).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine_state::EngineState;
use crate::executor::intent::Intent;
use crate::executor::AtomicExecutor;
use crate::market_data::book::BookSnapshot;
use crate::market_data::streams::{self, BoundedQueue};
use crate::portfolio::PortfolioSnapshot;
use crate::router::{CrossVenueRouter, LegQuote, RouteDecision};
use crate::signal::SignalGenerator;
use crate::types::{now_ms, MarketKind, PairId, PairSpec};
use crate::vacuum::VacuumDetector;
use crate::venue::VenueAdapter;

/// Flat cost assumed for moving collateral to a venue that does not already
/// hold the leg's wallet.
const FOREIGN_VENUE_TRANSFER_BPS: f64 = 2.0;

/// Wire all subsystems and spawn the long-lived tasks. Returns once
/// everything is running; the caller owns the shutdown channel.
pub async fn start(
    state: Arc<EngineState>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = state.config.read().clone();
    let pairs: Vec<PairSpec> = config.pairs.clone();

    // ── 1. Portfolio bootstrap: crash recovery, else venue balances ─────
    let mut restored = false;
    if let Some(store) = &state.store {
        match store.load_portfolio::<PortfolioSnapshot>() {
            Ok(snapshot) => {
                info!(
                    positions = snapshot.positions.len(),
                    age_ms = now_ms() - snapshot.at_ms,
                    "portfolio state recovered from disk"
                );
                state.portfolio.restore(snapshot);
                restored = true;
            }
            Err(e) => {
                info!(reason = %e, "no recoverable portfolio state, starting fresh");
            }
        }
    }
    if !restored {
        let primary = pairs
            .first()
            .and_then(|spec| venues.get(&spec.pair.venue))
            .context("no venue adapter registered for the first pair")?;
        match primary.wallet_balances().await {
            Ok(balances) => state.portfolio.set_wallets_from(&balances),
            Err(e) => {
                warn!(error = %e, "could not fetch venue balances, wallets start empty");
                state.push_error(format!("balance fetch failed: {e}"), None);
            }
        }
    }
    state.risk.seed_nav(state.portfolio.nav());

    // ── 2. Executor ─────────────────────────────────────────────────────
    let pair_map: HashMap<PairId, PairSpec> = pairs
        .iter()
        .map(|spec| (spec.pair.clone(), spec.clone()))
        .collect();
    let executor = Arc::new(AtomicExecutor::new(
        state.config.clone(),
        venues.clone(),
        pair_map,
        state.books.clone(),
        state.portfolio.clone(),
        state.risk.clone(),
        state.ledger.clone(),
        state.bus.clone(),
    ));
    *state.executor.write() = Some(executor.clone());

    for venue in venues.values() {
        executor.spawn_execution_pump(venue.clone());
    }

    // ── 3. Market data: book pumps + per-pair statistics tasks ──────────
    let vacuum = Arc::new(VacuumDetector::new(state.config.clone()));

    for spec in &pairs {
        let Some(venue) = venues.get(&spec.pair.venue) else {
            warn!(pair = %spec.pair, "no adapter for venue, pair disabled");
            continue;
        };

        let queue = Arc::new(BoundedQueue::<BookSnapshot>::new(
            config.snapshot_channel_capacity,
        ));
        state
            .snapshot_queues
            .write()
            .insert(spec.pair.clone(), queue.clone());

        for market in [MarketKind::Spot, MarketKind::Perp] {
            tokio::spawn(streams::run_book_pump(
                venue.clone(),
                spec.clone(),
                market,
                queue.clone(),
                shutdown.clone(),
            ));
        }

        tokio::spawn(streams::run_pair_stats_task(
            spec.clone(),
            queue,
            state.books.clone(),
            state.stats.clone(),
            state.portfolio.clone(),
            shutdown.clone(),
        ));

        // Liquidation pump feeding the vacuum detector's sliding window.
        {
            let venue = venue.clone();
            let vacuum = vacuum.clone();
            let spec = spec.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let mut rx = match venue.subscribe_liquidations(&spec.perp_instrument).await
                    {
                        Ok(rx) => rx,
                        Err(e) => {
                            error!(pair = %spec.pair, error = %e, "liquidation subscribe failed, retrying in 5s");
                            tokio::select! {
                                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                                _ = shutdown.changed() => return,
                            }
                        }
                    };
                    loop {
                        tokio::select! {
                            maybe = rx.recv() => match maybe {
                                Some(event) => vacuum.record_liquidation(&spec.pair, event),
                                None => break,
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }
    }
    info!(pairs = pairs.len(), "market data tasks launched");

    // ── 4. Signal tick ──────────────────────────────────────────────────
    {
        let state = state.clone();
        let executor = executor.clone();
        let vacuum = vacuum.clone();
        let pairs = pairs.clone();
        let mut shutdown = shutdown.clone();
        let generator = SignalGenerator::new(state.config.clone());
        // Pairs already claimed by a spawned-but-not-yet-registered submit.
        let pending: Arc<Mutex<HashSet<PairId>>> = Arc::new(Mutex::new(HashSet::new()));

        tokio::spawn(async move {
            let period = state.config.read().signal_period_ms;
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(period.max(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }

                let now = now_ms();
                let mut intents: Vec<Intent> = Vec::new();

                // Vacuum detection runs on the freshest basis, in parallel
                // with the threshold signals.
                for spec in &pairs {
                    if let Some(basis) = state.stats.basis_now(&spec.pair) {
                        if let Some(intent) =
                            vacuum.on_basis_update(&spec.pair, basis, now, &state.portfolio)
                        {
                            intents.push(intent);
                        }
                    }
                }
                intents.extend(vacuum.check_open_vacuums(
                    &state.portfolio,
                    |pair| state.stats.basis_now(pair),
                    now,
                ));

                {
                    let executor = executor.clone();
                    let pending_set = pending.lock().clone();
                    intents.extend(generator.evaluate(
                        &pairs,
                        &state.stats,
                        &state.books,
                        &state.portfolio,
                        &state.risk,
                        move |pair| {
                            executor.has_in_flight(pair) || pending_set.contains(pair)
                        },
                        now,
                    ));
                }

                for intent in intents {
                    let pair = intent.pair.clone();
                    if executor.has_in_flight(&pair) || !pending.lock().insert(pair.clone()) {
                        continue;
                    }
                    let Some(route) = route_intent(&state, &pairs, &intent, now) else {
                        pending.lock().remove(&pair);
                        continue;
                    };

                    let executor = executor.clone();
                    let pending = pending.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        executor.submit(intent, route).await;
                        pending.lock().remove(&pair);
                        state.increment_version();
                    });
                }
            }
        });
    }

    // ── 5. Risk monitor (250 ms) ────────────────────────────────────────
    {
        let state = state.clone();
        let executor = executor.clone();
        let pairs = pairs.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
            let mut health: HashMap<PairId, crate::types::PairHealth> = HashMap::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let outcome = state.risk.monitor_tick(&state.portfolio);
                if outcome.entered_safe_mode {
                    let drawdown = state.risk.state().drawdown_pct;
                    executor
                        .emergency_flatten(Some(format!("drawdown {drawdown:.1}%")))
                        .await;
                    state.increment_version();
                }

                // Surface market-data health transitions on the bus.
                let now = now_ms();
                for spec in &pairs {
                    let current = state.stats.health(&spec.pair, now);
                    let previous = health.insert(spec.pair.clone(), current);
                    if current == crate::types::PairHealth::Unsafe
                        && previous == Some(crate::types::PairHealth::Fresh)
                    {
                        warn!(pair = %spec.pair, "pair marked UNSAFE, signals suppressed");
                        state
                            .bus
                            .publish(crate::bus::EngineEvent::PairUnsafe {
                                pair: spec.pair.clone(),
                            });
                        state.push_error(format!("pair {} marked UNSAFE", spec.pair), None);
                    }
                }
            }
        });
    }

    // ── 5b. Funding poll (60 s): raw cash flows into ledger + wallets ───
    {
        let state = state.clone();
        let venues = venues.clone();
        let pairs = pairs.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut last_poll: HashMap<PairId, i64> = HashMap::new();
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                for spec in &pairs {
                    let Some(venue) = venues.get(&spec.pair.venue) else {
                        continue;
                    };
                    let since = *last_poll.entry(spec.pair.clone()).or_insert_with(now_ms);
                    match venue.funding_flows(&spec.perp_instrument, since).await {
                        Ok(flows) => {
                            for flow in flows {
                                last_poll.insert(spec.pair.clone(), flow.at_ms);
                                let amount = crate::types::dec(flow.amount);
                                state.portfolio.apply_funding(&spec.pair, amount);
                                state.ledger.record_funding(crate::ledger::FundingFlow {
                                    pair: spec.pair.clone(),
                                    amount,
                                    at_ms: flow.at_ms,
                                });
                            }
                        }
                        Err(e) => {
                            warn!(pair = %spec.pair, error = %e, "funding poll failed");
                        }
                    }
                }
            }
        });
    }

    // ── 6. Rebalancer (1 s) ─────────────────────────────────────────────
    {
        let primary = pairs
            .first()
            .and_then(|spec| venues.get(&spec.pair.venue))
            .cloned()
            .context("no venue adapter for rebalancer")?;
        let rebalancer = crate::rebalance::Rebalancer::new(
            state.config.clone(),
            state.portfolio.clone(),
            primary,
            state.bus.clone(),
            state.store.clone(),
        );
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                if rebalancer.tick().await.is_some() {
                    state.increment_version();
                }
            }
        });
    }

    // ── 7. Periodic portfolio snapshot ──────────────────────────────────
    if let Some(store) = state.store.clone() {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        let period = config.persist_interval_s.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        // Final snapshot on the way down.
                        let _ = store.save_portfolio(&state.portfolio.snapshot());
                        return;
                    }
                }
                if let Err(e) = store.save_portfolio(&state.portfolio.snapshot()) {
                    warn!(error = %e, "portfolio snapshot failed");
                    state.push_error(format!("portfolio snapshot failed: {e}"), None);
                }
            }
        });
    }

    // ── 8. Read-only API ────────────────────────────────────────────────
    {
        let api_state = state.clone();
        let bind_addr =
            std::env::var("SENTINEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
        tokio::spawn(async move {
            let app = crate::api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("all subsystems running");
    Ok(())
}

/// Build per-venue leg quotes and route an intent. Venues qualify when they
/// carry a registered pair with the same symbol; legs on a venue other than
/// the pair's home venue price in a flat transfer cost.
fn route_intent(
    state: &Arc<EngineState>,
    pairs: &[PairSpec],
    intent: &Intent,
    now: i64,
) -> Option<RouteDecision> {
    let cfg = state.config.read();
    let staleness = cfg.staleness_budget_ms;
    let router = CrossVenueRouter::new(cfg.cross_venue_margin_bps);
    drop(cfg);

    let mut spot_quotes = Vec::new();
    let mut perp_quotes = Vec::new();

    for spec in pairs.iter().filter(|s| s.pair.symbol == intent.pair.symbol) {
        let health = state.stats.health(&spec.pair, now);
        let (spot_impact, perp_impact) = state
            .stats
            .expected_impact_bps(&spec.pair)
            .unwrap_or((0.0, 0.0));
        let foreign = spec.pair.venue != intent.pair.venue;
        let transfer = if foreign { FOREIGN_VENUE_TRANSFER_BPS } else { 0.0 };

        let fresh = |market: MarketKind| {
            state
                .books
                .get(&spec.pair, market)
                .map(|b| !b.is_stale(now, staleness))
                .unwrap_or(false)
        };

        // Entry legs rest post-only, so the maker/taker fee gap acts as a
        // rebate relative to the taker-priced cost model.
        let maker_rebate = (spec.fee_taker_bps - spec.fee_maker_bps).max(0.0);

        spot_quotes.push(LegQuote {
            venue: spec.pair.venue.clone(),
            taker_fee_bps: spec.fee_taker_bps,
            expected_impact_bps: spot_impact,
            transfer_cost_bps: transfer,
            withdrawal_fee_bps: 0.0,
            maker_rebate_bps: maker_rebate,
            fresh: fresh(MarketKind::Spot),
            health,
        });
        perp_quotes.push(LegQuote {
            venue: spec.pair.venue.clone(),
            taker_fee_bps: spec.fee_taker_bps,
            expected_impact_bps: perp_impact,
            transfer_cost_bps: transfer,
            withdrawal_fee_bps: 0.0,
            maker_rebate_bps: maker_rebate,
            fresh: fresh(MarketKind::Perp),
            health,
        });
    }

    match router.route(&spot_quotes, &perp_quotes) {
        Ok(decision) => Some(decision),
        Err(e) => {
            warn!(intent_id = %intent.id, pair = %intent.pair, error = %e, "routing failed");
            state.push_error(format!("routing failed for {}: {e}", intent.pair), None);
            None
        }
    }
}
