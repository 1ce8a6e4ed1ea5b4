// =============================================================================
// Event Bus: typed engine events published to upstream consumers
// =============================================================================
//
// Every event kind carries a distinct payload; emission is synchronous within
// the publishing task and cross-task delivery rides a bounded broadcast
// channel. Slow subscribers lag and skip rather than back-pressure the
// engine. The WebSocket feed mirrors this channel verbatim.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{MarketKind, PairId, PositionKind};

/// Engine-wide event set. `causation` links an event back to the intent or
/// subsystem decision that produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    IntentSubmitted {
        id: String,
        pair: PairId,
        kind: String,
        notional: f64,
        cause: String,
    },
    IntentAccepted {
        id: String,
    },
    IntentRejected {
        id: String,
        reason: String,
        causation: Option<String>,
    },
    IntentTerminal {
        id: String,
        state: String,
        outcome: String,
    },
    FillRecorded {
        intent_id: String,
        leg_order_id: String,
        market: MarketKind,
        price: f64,
        qty: f64,
        fee: f64,
    },
    DeltaWarning {
        delta_bps: f64,
    },
    DrawdownTier {
        drawdown_pct: f64,
        tier: String,
    },
    SafeMode {
        entered: bool,
        drawdown_pct: f64,
    },
    EmergencyFlatten {
        open_positions: usize,
        causation: Option<String>,
    },
    RebalanceExecuted {
        tier: String,
        transferred: f64,
        util_before: f64,
        util_after: f64,
    },
    PositionReviewFlag {
        pair: PairId,
        kind: PositionKind,
        unrealized_loss_pct: f64,
    },
    InvariantViolation {
        detail: String,
    },
    PairUnsafe {
        pair: PairId,
    },
    TwapAborted {
        intent_id: String,
        clip: usize,
        slippage_bps: f64,
    },
}

impl EngineEvent {
    /// Short label for logs and the WS feed preview.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IntentSubmitted { .. } => "intent_submitted",
            Self::IntentAccepted { .. } => "intent_accepted",
            Self::IntentRejected { .. } => "intent_rejected",
            Self::IntentTerminal { .. } => "intent_terminal",
            Self::FillRecorded { .. } => "fill_recorded",
            Self::DeltaWarning { .. } => "delta_warning",
            Self::DrawdownTier { .. } => "drawdown_tier",
            Self::SafeMode { .. } => "safe_mode",
            Self::EmergencyFlatten { .. } => "emergency_flatten",
            Self::RebalanceExecuted { .. } => "rebalance_executed",
            Self::PositionReviewFlag { .. } => "position_review_flag",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::PairUnsafe { .. } => "pair_unsafe",
            Self::TwapAborted { .. } => "twap_aborted",
        }
    }
}

/// Cheap-to-clone handle around the broadcast sender.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Publish an event. Dropped silently when no subscriber is attached,
    /// which is the normal state in tests.
    pub fn publish(&self, event: EngineEvent) {
        debug!(kind = event.kind(), "engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::DeltaWarning { delta_bps: 250.0 });
        match rx.recv().await.unwrap() {
            EngineEvent::DeltaWarning { delta_bps } => assert!((delta_bps - 250.0).abs() < 1e-9),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        bus.publish(EngineEvent::IntentAccepted { id: "x".into() });
    }

    #[test]
    fn events_serialise_with_type_tag() {
        let ev = EngineEvent::SafeMode {
            entered: true,
            drawdown_pct: 10.2,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "safe_mode");
        assert_eq!(json["entered"], true);
    }
}
