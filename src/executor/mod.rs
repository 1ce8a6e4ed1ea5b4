// =============================================================================
// Atomic Executor: simultaneous two-leg placement with reconciliation
// =============================================================================
//
// `submit` returns only after both legs of an intent reached terminal states
// or a compensating reversal was executed. Each in-flight intent owns a
// mailbox; fill-ingress pumps route venue execution events into it by
// leg-order id, in ingress order. Large intents switch to TWAP slicing where
// every clip is itself a mini two-leg atomic action.
//
// Compensation deliberately ignores caller cancellation: once a one-sided
// fill exists, nulling delta outranks everything except process death.
// =============================================================================

pub mod intent;
pub mod reconcile;
pub mod twap;
pub mod txlog;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{EngineEvent, EventBus};
use crate::config::SentinelConfig;
use crate::executor::intent::{
    Intent, IntentCause, IntentKind, IntentOutcome, IntentState, LegOrder, LegState,
};
use crate::executor::reconcile::ReconcileAction;
use crate::executor::twap::{jitter_delay, slippage_bps, TwapPlan};
use crate::executor::txlog::TransactionLog;
use crate::ledger::{PerformanceLedger, Trade};
use crate::market_data::book::BookManager;
use crate::portfolio::PortfolioManager;
use crate::risk::RiskGuardian;
use crate::router::RouteDecision;
use crate::types::{dec, now_ms, MarketKind, PairId, PairSpec, PositionKind, Side};
use crate::venue::{ExecutionEvent, OrderKind, VenueAdapter, VenueOrderRequest};

/// A venue execution event stamped with ingress ordering metadata.
#[derive(Debug, Clone)]
struct RoutedEvent {
    event: ExecutionEvent,
    ingress_seq: u64,
}

struct IntentHandle {
    pair: PairId,
    event_tx: mpsc::UnboundedSender<RoutedEvent>,
    cancel_tx: watch::Sender<bool>,
}

/// Terminal report for one submitted intent.
#[derive(Debug, Clone)]
pub struct IntentResult {
    pub intent: Intent,
    pub route: RouteDecision,
    pub final_state: IntentState,
    pub outcome: IntentOutcome,
    pub spot_leg: LegOrder,
    pub perp_leg: LegOrder,
    pub compensation_legs: Vec<LegOrder>,
}

impl IntentResult {
    /// Net signed base quantity traded on one market, compensations included.
    pub fn net_qty(&self, market: MarketKind) -> f64 {
        let primary = match market {
            MarketKind::Spot => self.spot_leg.signed_filled_qty(),
            MarketKind::Perp => self.perp_leg.signed_filled_qty(),
        };
        primary
            + self
                .compensation_legs
                .iter()
                .filter(|l| l.market == market)
                .map(|l| l.signed_filled_qty())
                .sum::<f64>()
    }

    /// Net volume-weighted price on one market, compensations included.
    pub fn net_vwap(&self, market: MarketKind) -> f64 {
        let mut qty = 0.0;
        let mut notional = 0.0;
        {
            let mut fold = |leg: &LegOrder| {
                qty += leg.signed_filled_qty();
                notional += leg.signed_filled_qty() * leg.avg_fill_price;
            };
            match market {
                MarketKind::Spot => fold(&self.spot_leg),
                MarketKind::Perp => fold(&self.perp_leg),
            }
            for leg in self.compensation_legs.iter().filter(|l| l.market == market) {
                fold(leg);
            }
        }
        if qty.abs() > 1e-12 {
            notional / qty
        } else {
            0.0
        }
    }

    pub fn fees_total(&self) -> f64 {
        self.spot_leg.fees
            + self.perp_leg.fees
            + self.compensation_legs.iter().map(|l| l.fees).sum::<f64>()
    }
}

/// Intermediate execution outcome of one atomic action (full intent or clip).
struct ExecOutcome {
    spot_leg: LegOrder,
    perp_leg: LegOrder,
    comp_legs: Vec<LegOrder>,
    outcome: IntentOutcome,
    ref_spot: f64,
    ref_perp: f64,
}

/// Coarse per-intent state machine driver. Transitions outside the table are
/// skipped with a debug log; TWAP clips re-entering earlier phases land here
/// as no-ops.
struct Machine<'a> {
    txlog: &'a TransactionLog,
    intent_id: &'a str,
    state: IntentState,
}

impl<'a> Machine<'a> {
    fn try_to(&mut self, to: IntentState, note: Option<String>) {
        if self.state == to {
            return;
        }
        if self.state.can_transition(to) {
            self.txlog.append(self.intent_id, self.state, to, note);
            self.state = to;
        } else {
            debug!(
                intent_id = %self.intent_id,
                from = %self.state,
                to = %to,
                "skipping out-of-table transition"
            );
        }
    }
}

// =============================================================================
// AtomicExecutor
// =============================================================================

pub struct AtomicExecutor {
    config: Arc<RwLock<SentinelConfig>>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    pairs: HashMap<PairId, PairSpec>,
    books: Arc<BookManager>,
    portfolio: Arc<PortfolioManager>,
    risk: Arc<RiskGuardian>,
    ledger: Arc<PerformanceLedger>,
    bus: EventBus,
    txlog: Arc<TransactionLog>,
    in_flight: RwLock<HashMap<String, IntentHandle>>,
    leg_index: RwLock<HashMap<String, String>>,
    ingress_seq: AtomicU64,
}

impl AtomicExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<SentinelConfig>>,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        pairs: HashMap<PairId, PairSpec>,
        books: Arc<BookManager>,
        portfolio: Arc<PortfolioManager>,
        risk: Arc<RiskGuardian>,
        ledger: Arc<PerformanceLedger>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            venues,
            pairs,
            books,
            portfolio,
            risk,
            ledger,
            bus,
            txlog: Arc::new(TransactionLog::new(4096)),
            in_flight: RwLock::new(HashMap::new()),
            leg_index: RwLock::new(HashMap::new()),
            ingress_seq: AtomicU64::new(0),
        }
    }

    pub fn txlog(&self) -> &Arc<TransactionLog> {
        &self.txlog
    }

    /// Whether any intent for `pair` is currently non-terminal. The signal
    /// generator suppresses new triggers while this holds.
    pub fn has_in_flight(&self, pair: &PairId) -> bool {
        self.in_flight.read().values().any(|h| &h.pair == pair)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.read().len()
    }

    /// Best-effort cancel of one in-flight intent.
    pub fn cancel(&self, intent_id: &str) {
        if let Some(handle) = self.in_flight.read().get(intent_id) {
            let _ = handle.cancel_tx.send(true);
            info!(intent_id, "intent cancellation requested");
        }
    }

    pub fn cancel_all(&self) {
        for (id, handle) in self.in_flight.read().iter() {
            let _ = handle.cancel_tx.send(true);
            debug!(intent_id = %id, "cancel requested (cancel_all)");
        }
    }

    // -------------------------------------------------------------------------
    // Fill ingress
    // -------------------------------------------------------------------------

    /// Route a venue execution event to the owning intent's mailbox.
    pub fn dispatch_execution(&self, event: ExecutionEvent) {
        let intent_id = self.leg_index.read().get(event.leg_order_id()).cloned();
        let Some(intent_id) = intent_id else {
            debug!(
                leg_order_id = event.leg_order_id(),
                "execution event for unknown or superseded leg"
            );
            return;
        };
        let routed = RoutedEvent {
            event,
            ingress_seq: self.ingress_seq.fetch_add(1, Ordering::SeqCst),
        };
        if let Some(handle) = self.in_flight.read().get(&intent_id) {
            let _ = handle.event_tx.send(routed);
        }
    }

    /// Spawn a task forwarding a venue's execution stream into the executor.
    pub fn spawn_execution_pump(self: &Arc<Self>, venue: Arc<dyn VenueAdapter>) {
        let executor = self.clone();
        tokio::spawn(async move {
            loop {
                let mut rx = match venue.subscribe_execution().await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!(
                            venue = venue.id(),
                            error = %e,
                            "execution stream subscribe failed, retrying in 5s"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };
                while let Some(event) = rx.recv().await {
                    executor.dispatch_execution(event);
                }
                warn!(venue = venue.id(), "execution stream ended, resubscribing");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // Submit
    // -------------------------------------------------------------------------

    /// Execute an intent to a terminal state. The synchronous risk gate runs
    /// first; vetoed intents never touch a venue.
    pub async fn submit(&self, intent: Intent, route: RouteDecision) -> IntentResult {
        if let Err(veto) = self.risk.pre_trade(&intent, &self.portfolio) {
            let reason = veto.to_string();
            warn!(intent_id = %intent.id, reason = %reason, "intent vetoed by risk guardian");
            self.bus.publish(EngineEvent::IntentRejected {
                id: intent.id.clone(),
                reason: reason.clone(),
                causation: Some(intent.cause.to_string()),
            });
            return IntentResult {
                route,
                final_state: IntentState::Created,
                outcome: IntentOutcome::Rejected { reason },
                spot_leg: LegOrder::new(&intent.id, "", "", MarketKind::Spot, Side::Buy, 0.0, None),
                perp_leg: LegOrder::new(&intent.id, "", "", MarketKind::Perp, Side::Sell, 0.0, None),
                compensation_legs: Vec::new(),
                intent,
            };
        }

        self.bus.publish(EngineEvent::IntentSubmitted {
            id: intent.id.clone(),
            pair: intent.pair.clone(),
            kind: intent.kind.to_string(),
            notional: intent.target_notional,
            cause: intent.cause.to_string(),
        });

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.in_flight.write().insert(
            intent.id.clone(),
            IntentHandle {
                pair: intent.pair.clone(),
                event_tx,
                cancel_tx,
            },
        );
        self.bus.publish(EngineEvent::IntentAccepted {
            id: intent.id.clone(),
        });

        let mut machine = Machine {
            txlog: self.txlog.as_ref(),
            intent_id: &intent.id,
            state: IntentState::Created,
        };

        let use_twap = {
            let cfg = self.config.read();
            intent.target_notional > cfg.twap_threshold && !intent.urgent
        };

        let exec = if use_twap {
            self.run_twap(&intent, &route, &mut machine, &mut event_rx, cancel_rx)
                .await
        } else {
            let deadline = intent.deadline_ms();
            self.run_single(
                &intent,
                &route,
                intent.target_notional,
                deadline,
                &mut machine,
                &mut event_rx,
                cancel_rx,
            )
            .await
        };

        // Unregister before applying results so late events fall through.
        self.in_flight.write().remove(&intent.id);
        self.leg_index.write().retain(|_, owner| *owner != intent.id);

        let has_fills = exec.spot_leg.filled_qty > 0.0 || exec.perp_leg.filled_qty > 0.0;
        let final_state = match &exec.outcome {
            IntentOutcome::Done => IntentState::Done,
            IntentOutcome::Compensated => IntentState::Compensated,
            IntentOutcome::TimedOut => IntentState::TimedOut,
            // An aborted TWAP keeps its filled clips; the machine still
            // finishes cleanly when anything filled.
            IntentOutcome::Aborted { .. } if has_fills => IntentState::Done,
            IntentOutcome::Aborted { .. } => IntentState::Failed,
            IntentOutcome::BothFailed | IntentOutcome::Rejected { .. } => IntentState::Failed,
        };
        machine.try_to(final_state, Some(exec.outcome.to_string()));

        let result = IntentResult {
            intent: intent.clone(),
            route: route.clone(),
            final_state,
            outcome: exec.outcome.clone(),
            spot_leg: exec.spot_leg,
            perp_leg: exec.perp_leg,
            compensation_legs: exec.comp_legs,
        };

        self.apply_result(&result);

        self.bus.publish(EngineEvent::IntentTerminal {
            id: intent.id.clone(),
            state: final_state.to_string(),
            outcome: result.outcome.to_string(),
        });
        info!(
            intent_id = %intent.id,
            pair = %intent.pair,
            state = %final_state,
            outcome = %result.outcome,
            "intent terminal"
        );

        result
    }

    /// Cancel all in-flight intents, then issue urgent close intents for
    /// every open position, bypassing TWAP.
    pub async fn emergency_flatten(&self, causation: Option<String>) {
        let positions = self.portfolio.positions();
        warn!(
            open_positions = positions.len(),
            "EMERGENCY FLATTEN: cancelling in-flight intents and closing positions"
        );
        self.bus.publish(EngineEvent::EmergencyFlatten {
            open_positions: positions.len(),
            causation,
        });
        self.cancel_all();

        let (ttl_ms, max_slippage) = {
            let cfg = self.config.read();
            (cfg.intent_ttl_ms, cfg.max_slippage_bps)
        };

        for position in positions {
            let Some(marks) = self.portfolio.marks(&position.pair) else {
                warn!(pair = %position.pair, "no marks for position, cannot flatten");
                continue;
            };
            let notional = position.notional(&marks);
            if notional <= 0.0 {
                continue;
            }
            let kind = match position.kind {
                PositionKind::Vacuum => IntentKind::VacuumClose,
                _ => IntentKind::CloseHedge,
            };
            let cause = match position.kind {
                PositionKind::Core => IntentCause::CoreRebalance,
                _ => IntentCause::Emergency,
            };
            let direction = if position.spot_qty >= 0.0 {
                Side::Sell
            } else {
                Side::Buy
            };
            let close = Intent::new(
                kind,
                position.pair.clone(),
                direction,
                notional,
                max_slippage,
                ttl_ms,
                cause,
            )
            .urgent();
            let route = RouteDecision {
                venue_spot: position.pair.venue.clone(),
                venue_perp: position.pair.venue.clone(),
                expected_impact_bps: 0.0,
                single_venue: true,
            };
            let _ = self.submit(close, route).await;
        }
    }

    // -------------------------------------------------------------------------
    // Single-shot execution
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        intent: &Intent,
        route: &RouteDecision,
        notional: f64,
        deadline_ms: i64,
        machine: &mut Machine<'_>,
        event_rx: &mut mpsc::UnboundedReceiver<RoutedEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> ExecOutcome {
        let (aggression_bps, tolerance, depth_levels, budget) = {
            let cfg = self.config.read();
            (
                cfg.aggression_bps,
                cfg.delta_tolerance_notional,
                cfg.depth_levels,
                cfg.depth_notional_budget(),
            )
        };

        let fail = |reason: &str, ref_spot: f64, ref_perp: f64| ExecOutcome {
            spot_leg: LegOrder::new(
                &intent.id,
                "",
                "",
                MarketKind::Spot,
                intent.direction,
                0.0,
                None,
            ),
            perp_leg: LegOrder::new(
                &intent.id,
                "",
                "",
                MarketKind::Perp,
                intent.perp_side(),
                0.0,
                None,
            ),
            comp_legs: Vec::new(),
            outcome: IntentOutcome::Rejected {
                reason: reason.to_string(),
            },
            ref_spot,
            ref_perp,
        };

        let Some(spec) = self.pairs.get(&intent.pair) else {
            return fail("unregistered pair", 0.0, 0.0);
        };

        let Some(ref_spot) = self.reference_price(
            &intent.pair,
            MarketKind::Spot,
            intent.direction,
            depth_levels,
            budget,
        ) else {
            return fail("no spot reference price", 0.0, 0.0);
        };
        let Some(ref_perp) = self.reference_price(
            &intent.pair,
            MarketKind::Perp,
            intent.perp_side(),
            depth_levels,
            budget,
        ) else {
            return fail("no perp reference price", ref_spot, 0.0);
        };

        if notional < spec.min_notional {
            return fail("notional below venue minimum", ref_spot, ref_perp);
        }
        let spot_qty = spec.round_qty(notional / ref_spot);
        let perp_qty = spec.round_qty(notional / ref_perp);
        if spot_qty <= 0.0 || perp_qty <= 0.0 {
            return fail("notional below lot size", ref_spot, ref_perp);
        }

        // Marketable limit at the depth-weighted target plus aggression; the
        // urgent path goes straight to IOC.
        let aggress = |reference: f64, side: Side| {
            spec.round_price(reference * (1.0 + side.sign() * aggression_bps / 10_000.0))
        };
        let order_kind = if intent.urgent {
            OrderKind::Ioc
        } else {
            OrderKind::LimitPostOnly
        };

        let mut spot_leg = LegOrder::new(
            &intent.id,
            &route.venue_spot,
            &spec.spot_instrument,
            MarketKind::Spot,
            intent.direction,
            spot_qty,
            Some(aggress(ref_spot, intent.direction)),
        );
        let mut perp_leg = LegOrder::new(
            &intent.id,
            &route.venue_perp,
            &spec.perp_instrument,
            MarketKind::Perp,
            intent.perp_side(),
            perp_qty,
            Some(aggress(ref_perp, intent.perp_side())),
        );

        machine.try_to(IntentState::Placing, None);

        // Simultaneous placement inside the dispatch window.
        let placed_at = std::time::Instant::now();
        let (spot_placed, perp_placed) = tokio::join!(
            self.place_leg(&spot_leg, order_kind, deadline_ms),
            self.place_leg(&perp_leg, order_kind, deadline_ms),
        );
        let dispatch_elapsed = placed_at.elapsed().as_millis() as u64;
        {
            let window = self.config.read().dispatch_window_ms;
            if dispatch_elapsed > window {
                warn!(
                    intent_id = %intent.id,
                    elapsed_ms = dispatch_elapsed,
                    window_ms = window,
                    "leg dispatch exceeded target window"
                );
            }
        }

        match spot_placed {
            Ok(id) => {
                self.leg_index.write().insert(id.clone(), intent.id.clone());
                spot_leg.id = id;
                spot_leg.state = LegState::Live;
            }
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "spot leg placement failed");
                spot_leg.state = LegState::Rejected;
            }
        }
        match perp_placed {
            Ok(id) => {
                self.leg_index.write().insert(id.clone(), intent.id.clone());
                perp_leg.id = id;
                perp_leg.state = LegState::Live;
            }
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "perp leg placement failed");
                perp_leg.state = LegState::Rejected;
            }
        }

        if spot_leg.state == LegState::Rejected && perp_leg.state == LegState::Rejected {
            return ExecOutcome {
                spot_leg,
                perp_leg,
                comp_legs: Vec::new(),
                outcome: IntentOutcome::BothFailed,
                ref_spot,
                ref_perp,
            };
        }

        machine.try_to(IntentState::Live, None);

        // ── Event loop until both legs terminal or deadline ────────────────
        let escalate_at_ms = intent.created_at_ms + (deadline_ms - intent.created_at_ms) / 2;
        let mut escalated = intent.urgent;
        let mut canceled_by_caller = false;
        let mut timed_out = false;

        while !(spot_leg.state.is_terminal() && perp_leg.state.is_terminal()) {
            let now = now_ms();
            if now >= deadline_ms {
                timed_out = true;
                break;
            }
            let next_checkpoint = if escalated {
                deadline_ms
            } else {
                escalate_at_ms.min(deadline_ms)
            };
            let wait = std::time::Duration::from_millis((next_checkpoint - now).max(1) as u64);

            tokio::select! {
                maybe = event_rx.recv() => {
                    let Some(routed) = maybe else { break };
                    self.apply_event(intent, &mut spot_leg, &mut perp_leg, &mut Vec::new(), routed);
                    // Drain whatever else already arrived so decisions see a
                    // consistent batch, not a half-delivered one.
                    while let Ok(routed) = event_rx.try_recv() {
                        self.apply_event(intent, &mut spot_leg, &mut perp_leg, &mut Vec::new(), routed);
                    }

                    // One leg died while the other works: pull the survivor so
                    // the filled imbalance stops growing. Any shortfall is
                    // topped up by the post-trade reconciliation below.
                    if spot_leg.state.is_terminal() != perp_leg.state.is_terminal() {
                        let (target, alive) = if spot_leg.state.is_terminal() {
                            (spot_leg.filled_qty, &mut perp_leg)
                        } else {
                            (perp_leg.filled_qty, &mut spot_leg)
                        };
                        if alive.qty > target + 1e-12 && !alive.state.is_terminal() {
                            self.cancel_leg_ref(alive).await;
                        }
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    if !escalated && now_ms() >= escalate_at_ms {
                        escalated = true;
                        // Half the TTL is gone: stop resting, take liquidity.
                        if !spot_leg.state.is_terminal() && spot_leg.filled_qty < spot_leg.qty - 1e-12 {
                            self.escalate_leg(intent, &mut spot_leg, depth_levels, budget).await;
                        }
                        if !perp_leg.state.is_terminal() && perp_leg.filled_qty < perp_leg.qty - 1e-12 {
                            self.escalate_leg(intent, &mut perp_leg, depth_levels, budget).await;
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        canceled_by_caller = true;
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        // Deadline or cancel: pull outstanding legs, then drain briefly.
        if timed_out {
            for leg in [&spot_leg, &perp_leg] {
                self.cancel_leg_ref(leg).await;
            }
            let grace = tokio::time::Instant::now() + std::time::Duration::from_millis(300);
            while !(spot_leg.state.is_terminal() && perp_leg.state.is_terminal()) {
                match tokio::time::timeout_at(grace, event_rx.recv()).await {
                    Ok(Some(routed)) => {
                        self.apply_event(intent, &mut spot_leg, &mut perp_leg, &mut Vec::new(), routed)
                    }
                    _ => break,
                }
            }
            for leg in [&mut spot_leg, &mut perp_leg] {
                if !leg.state.is_terminal() {
                    leg.state = LegState::TimedOut;
                }
            }
        }

        // ── Post-trade reconciliation ──────────────────────────────────────
        let has_fills = spot_leg.filled_qty > 0.0 || perp_leg.filled_qty > 0.0;
        if has_fills {
            machine.try_to(IntentState::Reconciling, None);
        }

        let mut comp_legs: Vec<LegOrder> = Vec::new();
        let mut compensated = false;
        for attempt in 0..2 {
            let residual = Self::residual_with_comps(&spot_leg, &perp_leg, &comp_legs);
            if residual.abs() * ref_spot <= tolerance {
                break;
            }

            let (market, side, qty) = if attempt == 0 {
                match reconcile::plan(&spot_leg, &perp_leg, ref_spot, tolerance) {
                    ReconcileAction::None => break,
                    ReconcileAction::MicroOrder { market, side, qty } => (market, side, qty),
                    ReconcileAction::ResizeTrailing { market, .. } => {
                        // The trailing order is already canceled; the
                        // shortfall is topped up in place.
                        let side = if residual > 0.0 { Side::Sell } else { Side::Buy };
                        (market, side, residual.abs())
                    }
                }
            } else {
                // A compensator itself came up short; take the residual out
                // on the perp, the deeper book.
                let side = if residual > 0.0 { Side::Sell } else { Side::Buy };
                (MarketKind::Perp, side, residual.abs())
            };

            machine.try_to(
                IntentState::Compensating,
                Some(format!("residual qty {residual:.6}")),
            );
            compensated = true;
            match self
                .compensate(intent, route, spec, market, side, qty, event_rx)
                .await
            {
                Some(leg) => comp_legs.push(leg),
                None => break,
            }
        }

        let residual = Self::residual_with_comps(&spot_leg, &perp_leg, &comp_legs);
        if residual.abs() * ref_spot > tolerance {
            // Surface the full transition history alongside the violation so
            // operators can reconstruct the leg sequence.
            warn!(
                intent_id = %intent.id,
                history = ?self.txlog.for_intent(&intent.id),
                spot = ?spot_leg,
                perp = ?perp_leg,
                "residual delta beyond tolerance after compensation"
            );
            self.risk.note_invariant_violation(format!(
                "intent {} residual delta {:.2} beyond tolerance after compensation",
                intent.id,
                residual * ref_spot
            ));
        }

        let outcome = if compensated {
            IntentOutcome::Compensated
        } else if spot_leg.state == LegState::Rejected && perp_leg.state == LegState::Rejected {
            IntentOutcome::BothFailed
        } else if canceled_by_caller && !has_fills {
            IntentOutcome::Aborted {
                reason: "canceled".to_string(),
            }
        } else if timed_out && !has_fills {
            IntentOutcome::TimedOut
        } else if has_fills {
            IntentOutcome::Done
        } else {
            IntentOutcome::BothFailed
        };

        ExecOutcome {
            spot_leg,
            perp_leg,
            comp_legs,
            outcome,
            ref_spot,
            ref_perp,
        }
    }

    /// Residual signed base quantity across primary and compensation legs.
    fn residual_with_comps(spot: &LegOrder, perp: &LegOrder, comps: &[LegOrder]) -> f64 {
        spot.signed_filled_qty()
            + perp.signed_filled_qty()
            + comps.iter().map(|l| l.signed_filled_qty()).sum::<f64>()
    }

    /// Place one compensating IOC order and wait for it to resolve.
    /// Compensation ignores caller-level cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn compensate(
        &self,
        intent: &Intent,
        route: &RouteDecision,
        spec: &PairSpec,
        market: MarketKind,
        side: Side,
        qty: f64,
        event_rx: &mut mpsc::UnboundedReceiver<RoutedEvent>,
    ) -> Option<LegOrder> {
        let venue_id = match market {
            MarketKind::Spot => &route.venue_spot,
            MarketKind::Perp => &route.venue_perp,
        };
        let (depth_levels, budget) = {
            let cfg = self.config.read();
            (cfg.depth_levels, cfg.depth_notional_budget())
        };
        // Priced at the current depth-weighted level plus the intent's
        // slippage budget; market only when the book is gone.
        let reference = self
            .reference_price(&intent.pair, market, side, depth_levels, budget)
            .map(|r| r * (1.0 + side.sign() * intent.max_slippage_bps / 10_000.0));

        let qty = spec.round_qty(qty);
        if qty <= 0.0 {
            return None;
        }

        let mut comp = LegOrder::new(
            &intent.id,
            venue_id,
            spec.instrument(market),
            market,
            side,
            qty,
            reference.map(|r| spec.round_price(r)),
        );
        let kind = if reference.is_some() {
            OrderKind::Ioc
        } else {
            OrderKind::Market
        };

        warn!(
            intent_id = %intent.id,
            market = %market,
            side = %side,
            qty,
            "placing compensating reversal"
        );

        match self.place_leg(&comp, kind, now_ms() + 2_000).await {
            Ok(id) => {
                self.leg_index.write().insert(id.clone(), intent.id.clone());
                comp.id = id;
                comp.state = LegState::Live;
            }
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "compensating order placement failed");
                comp.state = LegState::Rejected;
                return Some(comp);
            }
        }

        // Wait for the compensator to resolve; bounded, but not cancellable.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !comp.state.is_terminal() {
            match tokio::time::timeout_at(deadline, event_rx.recv()).await {
                Ok(Some(routed)) => {
                    if routed.event.leg_order_id() == comp.id {
                        if let ExecutionEvent::Fill { price, qty, fee, .. } = &routed.event {
                            self.bus.publish(EngineEvent::FillRecorded {
                                intent_id: intent.id.clone(),
                                leg_order_id: comp.id.clone(),
                                market,
                                price: *price,
                                qty: *qty,
                                fee: *fee,
                            });
                        }
                        Self::apply_to_leg(&mut comp, &routed.event);
                    }
                }
                _ => break,
            }
        }
        Some(comp)
    }

    /// Cancel a leg's resting order without superseding its id, so fills
    /// already in flight still land in the accounting.
    async fn cancel_leg_ref(&self, leg: &LegOrder) {
        if leg.id.is_empty() || leg.state.is_terminal() {
            return;
        }
        if let Some(venue) = self.venues.get(&leg.venue) {
            if let Err(e) = venue.cancel_order(&leg.instrument, &leg.id).await {
                debug!(leg_order_id = %leg.id, error = %e, "cancel failed");
            }
        }
    }

    /// Replace a resting leg's remainder with an IOC at the current
    /// depth-weighted reference.
    async fn escalate_leg(
        &self,
        intent: &Intent,
        leg: &mut LegOrder,
        depth_levels: usize,
        budget: f64,
    ) {
        if let Some(venue) = self.venues.get(&leg.venue) {
            if !leg.id.is_empty() {
                let _ = venue.cancel_order(&leg.instrument, &leg.id).await;
                self.leg_index.write().remove(&leg.id);
            }
        }

        let remainder = leg.qty - leg.filled_qty;
        if remainder <= 1e-12 {
            return;
        }
        // Marketable IOC bounded by the intent's slippage budget.
        let reference = self
            .reference_price(&intent.pair, leg.market, leg.side, depth_levels, budget)
            .map(|r| r * (1.0 + leg.side.sign() * intent.max_slippage_bps / 10_000.0));
        let mut replacement = leg.clone();
        replacement.price = reference;
        replacement.qty = remainder;
        match self
            .place_leg(&replacement, OrderKind::Ioc, now_ms() + 1_000)
            .await
        {
            Ok(id) => {
                self.leg_index.write().insert(id.clone(), intent.id.clone());
                leg.id = id;
                leg.state = LegState::Live;
                debug!(
                    intent_id = %intent.id,
                    market = %leg.market,
                    remainder,
                    "resting leg escalated to IOC"
                );
            }
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "IOC escalation failed");
                leg.state = if leg.filled_qty > 0.0 {
                    LegState::Partial
                } else {
                    LegState::Canceled
                };
            }
        }
    }

    /// Place one leg with capped exponential backoff on transient errors,
    /// bounded by the intent deadline.
    async fn place_leg(
        &self,
        leg: &LegOrder,
        kind: OrderKind,
        deadline_ms: i64,
    ) -> anyhow::Result<String> {
        let venue = self
            .venues
            .get(&leg.venue)
            .ok_or_else(|| anyhow::anyhow!("unknown venue {}", leg.venue))?;

        let request = VenueOrderRequest {
            instrument: leg.instrument.clone(),
            market: leg.market,
            side: leg.side,
            kind,
            price: match kind {
                OrderKind::Market => None,
                _ => leg.price,
            },
            qty: leg.qty,
            client_tag: format!("{}:{}", leg.intent_id, leg.market),
        };

        let mut backoff_ms = 100u64;
        let mut last_err = None;
        for attempt in 0..3 {
            match venue.place_order(request.clone()).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    debug!(attempt, error = %e, "leg placement attempt failed");
                    last_err = Some(e);
                }
            }
            if now_ms() + backoff_ms as i64 >= deadline_ms {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2;
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("placement failed")))
    }

    /// Apply one routed event to whichever leg it addresses.
    fn apply_event(
        &self,
        intent: &Intent,
        spot_leg: &mut LegOrder,
        perp_leg: &mut LegOrder,
        comp_legs: &mut Vec<LegOrder>,
        routed: RoutedEvent,
    ) {
        let id = routed.event.leg_order_id().to_string();
        let leg = if spot_leg.id == id {
            Some(&mut *spot_leg)
        } else if perp_leg.id == id {
            Some(&mut *perp_leg)
        } else {
            comp_legs.iter_mut().find(|l| l.id == id)
        };
        let Some(leg) = leg else {
            debug!(leg_order_id = %id, seq = routed.ingress_seq, "event for superseded leg id");
            return;
        };

        if let ExecutionEvent::Fill { price, qty, fee, .. } = &routed.event {
            self.bus.publish(EngineEvent::FillRecorded {
                intent_id: intent.id.clone(),
                leg_order_id: id,
                market: leg.market,
                price: *price,
                qty: *qty,
                fee: *fee,
            });
        }
        Self::apply_to_leg(leg, &routed.event);
    }

    fn apply_to_leg(leg: &mut LegOrder, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Fill { price, qty, fee, .. } => leg.apply_fill(*price, *qty, *fee),
            ExecutionEvent::Rejected { reason, .. } => {
                debug!(leg_order_id = %leg.id, reason = %reason, "leg rejected");
                leg.state = LegState::Rejected;
            }
            ExecutionEvent::Canceled { .. } => {
                if !leg.state.is_terminal() {
                    leg.state = LegState::Canceled;
                }
            }
            ExecutionEvent::Expired { .. } => {
                if !leg.state.is_terminal() {
                    leg.state = LegState::TimedOut;
                }
            }
        }
    }

    fn reference_price(
        &self,
        pair: &PairId,
        market: MarketKind,
        side: Side,
        depth_levels: usize,
        budget: f64,
    ) -> Option<f64> {
        if let Some(book) = self.books.get(pair, market) {
            if let Some(dw) = book.depth_weighted_for(side, depth_levels, budget) {
                return Some(dw.price);
            }
            if let Some(mid) = book.mid() {
                return Some(mid);
            }
        }
        self.portfolio.marks(pair).map(|m| match market {
            MarketKind::Spot => m.spot,
            MarketKind::Perp => m.perp,
        })
    }

    // -------------------------------------------------------------------------
    // TWAP execution
    // -------------------------------------------------------------------------

    async fn run_twap(
        &self,
        intent: &Intent,
        route: &RouteDecision,
        machine: &mut Machine<'_>,
        event_rx: &mut mpsc::UnboundedReceiver<RoutedEvent>,
        cancel_rx: watch::Receiver<bool>,
    ) -> ExecOutcome {
        let (clip_max, interval_min, interval_max, abort_bps, ttl_ms, tolerance) = {
            let cfg = self.config.read();
            (
                cfg.twap_clip_max,
                cfg.twap_interval_min_s,
                cfg.twap_interval_max_s,
                cfg.twap_abort_bps,
                cfg.intent_ttl_ms,
                cfg.delta_tolerance_notional,
            )
        };

        let plan = TwapPlan::new(intent.target_notional, clip_max);
        info!(
            intent_id = %intent.id,
            clips = plan.clips.len(),
            clip_max,
            "TWAP execution started"
        );

        fn merge(agg: &mut Option<LegOrder>, leg: &LegOrder) {
            match agg {
                None => *agg = Some(leg.clone()),
                Some(existing) => {
                    existing.qty += leg.qty;
                    if leg.filled_qty > 0.0 {
                        existing.apply_fill(leg.avg_fill_price, leg.filled_qty, leg.fees);
                    }
                }
            }
        }

        let mut agg_spot: Option<LegOrder> = None;
        let mut agg_perp: Option<LegOrder> = None;
        let mut comp_legs: Vec<LegOrder> = Vec::new();
        let mut outcome = IntentOutcome::Done;
        let mut last_refs = (0.0, 0.0);

        for clip in &plan.clips {
            if *cancel_rx.borrow() {
                outcome = IntentOutcome::Aborted {
                    reason: "canceled".to_string(),
                };
                break;
            }

            let clip_deadline = now_ms() + ttl_ms as i64;
            let clip_exec = self
                .run_single(
                    intent,
                    route,
                    clip.notional,
                    clip_deadline,
                    machine,
                    event_rx,
                    cancel_rx.clone(),
                )
                .await;

            last_refs = (clip_exec.ref_spot, clip_exec.ref_perp);
            merge(&mut agg_spot, &clip_exec.spot_leg);
            merge(&mut agg_perp, &clip_exec.perp_leg);
            comp_legs.extend(clip_exec.comp_legs);

            if clip_exec.outcome != IntentOutcome::Done {
                // Per policy, filled clips are never reversed.
                outcome = IntentOutcome::Aborted {
                    reason: format!("clip {} terminated {}", clip.index, clip_exec.outcome),
                };
                break;
            }

            // Clip slippage versus the clip's own reference prices.
            let spot_slip = slippage_bps(
                clip_exec.ref_spot,
                clip_exec.spot_leg.avg_fill_price,
                intent.direction.sign(),
            );
            let perp_slip = slippage_bps(
                clip_exec.ref_perp,
                clip_exec.perp_leg.avg_fill_price,
                intent.perp_side().sign(),
            );
            let worst = spot_slip.max(perp_slip);
            if worst > abort_bps {
                warn!(
                    intent_id = %intent.id,
                    clip = clip.index,
                    slippage_bps = worst,
                    "TWAP abort: clip slippage beyond budget"
                );
                self.bus.publish(EngineEvent::TwapAborted {
                    intent_id: intent.id.clone(),
                    clip: clip.index,
                    slippage_bps: worst,
                });
                outcome = IntentOutcome::Aborted {
                    reason: format!("clip {} slippage {worst:.1}bps", clip.index),
                };
                break;
            }

            // Proportionality: the cumulative legs must track each other at
            // every clip boundary.
            if let (Some(s), Some(p)) = (&agg_spot, &agg_perp) {
                let spot_notional = s.filled_notional();
                let perp_notional = p.filled_notional();
                if (spot_notional - perp_notional).abs() > tolerance {
                    self.risk.note_invariant_violation(format!(
                        "TWAP intent {} cumulative legs diverged: spot {:.2} vs perp {:.2}",
                        intent.id, spot_notional, perp_notional
                    ));
                }
            }

            if clip.index + 1 < plan.clips.len() {
                tokio::time::sleep(jitter_delay(interval_min, interval_max)).await;
            }
        }

        ExecOutcome {
            spot_leg: agg_spot.unwrap_or_else(|| {
                LegOrder::new(
                    &intent.id,
                    "",
                    "",
                    MarketKind::Spot,
                    intent.direction,
                    0.0,
                    None,
                )
            }),
            perp_leg: agg_perp.unwrap_or_else(|| {
                LegOrder::new(
                    &intent.id,
                    "",
                    "",
                    MarketKind::Perp,
                    intent.perp_side(),
                    0.0,
                    None,
                )
            }),
            comp_legs,
            outcome,
            ref_spot: last_refs.0,
            ref_perp: last_refs.1,
        }
    }

    // -------------------------------------------------------------------------
    // Result application: portfolio mutation + trade records
    // -------------------------------------------------------------------------

    fn apply_result(&self, result: &IntentResult) {
        let intent = &result.intent;
        let net_spot = result.net_qty(MarketKind::Spot);
        let net_perp = result.net_qty(MarketKind::Perp);
        let hedged_qty = if net_spot * net_perp < 0.0 {
            net_spot.abs().min(net_perp.abs())
        } else {
            0.0
        };
        let avg_spot = result.net_vwap(MarketKind::Spot);
        let avg_perp = result.net_vwap(MarketKind::Perp);
        let fees = result.fees_total();
        let now = now_ms();

        let mut trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: intent.id.clone(),
            pair: intent.pair.clone(),
            kind: intent.kind,
            direction: intent.direction,
            open_t_ms: intent.created_at_ms,
            close_t_ms: None,
            entry_basis: 0.0,
            exit_basis: None,
            notional: hedged_qty * avg_spot.abs(),
            fees_total: dec(fees),
            funding_attributed: rust_decimal::Decimal::ZERO,
            basis_scalp_pnl: rust_decimal::Decimal::ZERO,
            realized_pnl: rust_decimal::Decimal::ZERO,
            holding_ms: 0,
            outcome: result.outcome.to_string(),
            route: Some(result.route.clone()),
        };

        match intent.kind {
            IntentKind::OpenHedge | IntentKind::VacuumOpen => {
                if hedged_qty > 1e-12 && avg_spot > 0.0 && avg_perp > 0.0 {
                    let entry_basis = crate::stats::basis_of(avg_spot, avg_perp);
                    self.portfolio.open_position(
                        &intent.pair,
                        intent.position_kind(),
                        net_spot,
                        net_perp,
                        avg_spot,
                        avg_perp,
                        entry_basis,
                        intent.target_basis,
                        dec(result.spot_leg.fees),
                        dec(fees - result.spot_leg.fees),
                    );
                    trade.entry_basis = entry_basis;
                }
                self.ledger.record(trade);
            }
            IntentKind::CloseHedge | IntentKind::VacuumClose => {
                if hedged_qty > 1e-12 {
                    if let Some(position) =
                        self.portfolio.position(&intent.pair, intent.position_kind())
                    {
                        let exit_basis = if avg_spot > 0.0 {
                            crate::stats::basis_of(avg_spot, avg_perp)
                        } else {
                            0.0
                        };
                        let fraction = (hedged_qty / position.spot_qty.abs().max(1e-12)).min(1.0);
                        let realized = self
                            .portfolio
                            .reduce_position(
                                &position.id,
                                hedged_qty,
                                avg_spot.abs(),
                                avg_perp.abs(),
                                exit_basis,
                                dec(result.spot_leg.fees),
                                dec(fees - result.spot_leg.fees),
                            )
                            .unwrap_or_default();

                        trade.entry_basis = position.entry_basis;
                        trade.exit_basis = Some(exit_basis);
                        trade.close_t_ms = Some(now);
                        trade.holding_ms = (now - position.opened_at_ms).max(0);
                        trade.basis_scalp_pnl = realized;
                        trade.funding_attributed = position.funding_paid * dec(fraction);
                        trade.realized_pnl =
                            realized + trade.funding_attributed - dec(fees);
                    }
                }
                self.ledger.record(trade);
            }
        }
    }
}

impl std::fmt::Debug for AtomicExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicExecutor")
            .field("venues", &self.venues.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight.read().len())
            .finish()
    }
}
