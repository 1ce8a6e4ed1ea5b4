// =============================================================================
// Transaction log: append-only record of intent state transitions
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::executor::intent::IntentState;
use crate::types::now_ms;

/// One logged transition. `seq` is globally monotonic across all intents.
#[derive(Debug, Clone, Serialize)]
pub struct TxRecord {
    pub seq: u64,
    pub at_ms: i64,
    pub intent_id: String,
    pub from: IntentState,
    pub to: IntentState,
    pub note: Option<String>,
}

/// In-memory append-only transition log with bounded retention. The newest
/// records back the dashboard; persistence of trades happens in the ledger.
pub struct TransactionLog {
    seq: AtomicU64,
    records: RwLock<Vec<TxRecord>>,
    retain: usize,
}

impl TransactionLog {
    pub fn new(retain: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            records: RwLock::new(Vec::new()),
            retain: retain.max(16),
        }
    }

    /// Append a transition and return its sequence number.
    pub fn append(
        &self,
        intent_id: &str,
        from: IntentState,
        to: IntentState,
        note: Option<String>,
    ) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.write();
        records.push(TxRecord {
            seq,
            at_ms: now_ms(),
            intent_id: intent_id.to_string(),
            from,
            to,
            note,
        });
        let overflow = records.len().saturating_sub(self.retain);
        if overflow > 0 {
            records.drain(..overflow);
        }
        seq
    }

    pub fn recent(&self, count: usize) -> Vec<TxRecord> {
        let records = self.records.read();
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn for_intent(&self, intent_id: &str) -> Vec<TxRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.intent_id == intent_id)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("next_seq", &self.seq.load(Ordering::Relaxed))
            .field("retained", &self.records.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let log = TransactionLog::new(100);
        let a = log.append("i1", IntentState::Created, IntentState::Placing, None);
        let b = log.append("i1", IntentState::Placing, IntentState::Live, None);
        let c = log.append("i2", IntentState::Created, IntentState::Placing, None);
        assert!(a < b && b < c);
    }

    #[test]
    fn per_intent_history_is_ordered() {
        let log = TransactionLog::new(100);
        log.append("i1", IntentState::Created, IntentState::Placing, None);
        log.append("i2", IntentState::Created, IntentState::Placing, None);
        log.append("i1", IntentState::Placing, IntentState::Live, None);

        let history = log.for_intent("i1");
        assert_eq!(history.len(), 2);
        assert!(history[0].seq < history[1].seq);
        assert_eq!(history[1].to, IntentState::Live);
    }

    #[test]
    fn retention_drops_oldest() {
        let log = TransactionLog::new(16);
        for _ in 0..40 {
            log.append("i", IntentState::Created, IntentState::Placing, None);
        }
        let recent = log.recent(100);
        assert_eq!(recent.len(), 16);
        // Newest first.
        assert!(recent[0].seq > recent[15].seq);
    }
}
