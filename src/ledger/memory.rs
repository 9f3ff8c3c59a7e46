//! In-memory ledger for tests and dry runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::{LedgerEntry, LedgerSink, NewLedgerEntry};
use crate::error::{Result, SchedulerError};

/// Ledger held in a `Vec`. Unlike `JsonlLedger` it records duplicates, so
/// tests can observe double materialization.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    failing_appends: AtomicU32,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with a `Persistence` error.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LedgerSink for MemoryLedger {
    async fn append(&self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let failing = self.failing_appends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_appends.store(failing - 1, Ordering::SeqCst);
            return Err(SchedulerError::Persistence(format!(
                "injected failure appending entry for {}",
                entry.rule_id
            )));
        }

        let recorded = entry.into_entry();
        self.entries
            .lock()
            .map_err(|e| SchedulerError::Persistence(e.to_string()))?
            .push(recorded.clone());
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_entry() -> NewLedgerEntry {
        NewLedgerEntry {
            rule_id: "rule-1".to_string(),
            amount: 5.0,
            category: "coffee".to_string(),
            currency: "USD".to_string(),
            note: None,
            device_name: None,
            spending_time: Utc::now(),
            occurrence_key: "k".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_records() {
        let ledger = MemoryLedger::new();
        assert!(ledger.is_empty());
        ledger.append(new_entry()).await.unwrap();
        ledger.append(new_entry()).await.unwrap();
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_records_nothing() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_appends(1);
        assert!(matches!(
            ledger.append(new_entry()).await.unwrap_err(),
            SchedulerError::Persistence(_)
        ));
        assert!(ledger.is_empty());
        ledger.append(new_entry()).await.unwrap();
        assert_eq!(ledger.len(), 1);
    }
}
