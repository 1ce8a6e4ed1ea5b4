// =============================================================================
// Liquidation intake: sliding window of large forced closes per pair
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{PairId, Side};

/// A forced liquidation observed on a venue.
///
/// `side` is the side of the *liquidated position*: `Buy` means longs were
/// force-sold, `Sell` means shorts were force-bought.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub notional: f64,
    pub price: f64,
    pub at_ms: i64,
}

/// Sliding window of recent liquidations per pair, filtered to events at or
/// above a notional floor. Pruning happens on every access, so readers always
/// see only events inside the window.
pub struct LiquidationWindow {
    window_ms: i64,
    min_notional: f64,
    events: RwLock<HashMap<PairId, VecDeque<LiquidationEvent>>>,
}

impl LiquidationWindow {
    pub fn new(window_ms: u64, min_notional: f64) -> Self {
        Self {
            window_ms: window_ms as i64,
            min_notional,
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Record a liquidation. Events under the notional floor are discarded.
    pub fn record(&self, pair: &PairId, event: LiquidationEvent) {
        if event.notional < self.min_notional {
            return;
        }
        debug!(
            pair = %pair,
            side = %event.side,
            notional = event.notional,
            "liquidation recorded"
        );
        let mut map = self.events.write();
        let queue = map.entry(pair.clone()).or_default();
        queue.push_back(event);
    }

    /// Count and total notional of in-window liquidations matching `side`.
    pub fn matching(&self, pair: &PairId, side: Side, now_ms: i64) -> (usize, f64) {
        let mut map = self.events.write();
        let Some(queue) = map.get_mut(pair) else {
            return (0, 0.0);
        };
        Self::prune(queue, now_ms, self.window_ms);

        let mut count = 0;
        let mut total = 0.0;
        for ev in queue.iter().filter(|ev| ev.side == side) {
            count += 1;
            total += ev.notional;
        }
        (count, total)
    }

    fn prune(queue: &mut VecDeque<LiquidationEvent>, now_ms: i64, window_ms: i64) {
        while let Some(front) = queue.front() {
            if now_ms - front.at_ms > window_ms {
                queue.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for LiquidationWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidationWindow")
            .field("window_ms", &self.window_ms)
            .field("min_notional", &self.min_notional)
            .field("pairs", &self.events.read().len())
            .finish()
    }
}
