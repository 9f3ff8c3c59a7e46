//! Ledger sink: where executed rules materialize as transactions.
//!
//! The scheduler only appends. Each entry carries an occurrence key derived
//! from the rule ID and the scheduled instant, so a ledger that already holds
//! an occurrence can decline to record it twice.

mod jsonl;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::RecurrenceRule;
use crate::error::Result;
use crate::id::{generate_entry_id, now_ms, occurrence_key};

pub use jsonl::JsonlLedger;
pub use memory::MemoryLedger;

/// Append-only sink for materialized transactions.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    /// Record an entry. An `Err` means nothing was recorded.
    async fn append(&self, entry: NewLedgerEntry) -> Result<LedgerEntry>;
}

/// Entry to be recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub rule_id: String,
    pub amount: f64,
    pub category: String,
    pub currency: String,
    pub note: Option<String>,
    pub device_name: Option<String>,
    /// Instant of execution
    pub spending_time: DateTime<Utc>,
    /// Identifies the scheduled occurrence this entry materializes
    pub occurrence_key: String,
}

impl NewLedgerEntry {
    /// Materialize `rule`'s template for its current occurrence.
    pub fn from_rule(rule: &RecurrenceRule, spending_time: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule.id.clone(),
            amount: rule.template.amount,
            category: rule.template.category.clone(),
            currency: rule.template.currency.clone(),
            note: rule.template.note.clone(),
            device_name: rule.template.device_name.clone(),
            spending_time,
            occurrence_key: occurrence_key(&rule.id, rule.next_run_at),
        }
    }

    fn into_entry(self) -> LedgerEntry {
        LedgerEntry {
            id: generate_entry_id(),
            rule_id: self.rule_id,
            amount: self.amount,
            category: self.category,
            currency: self.currency,
            note: self.note,
            device_name: self.device_name,
            spending_time: self.spending_time,
            occurrence_key: self.occurrence_key,
            created_at: now_ms(),
        }
    }
}

/// A recorded transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub rule_id: String,
    pub amount: f64,
    pub category: String,
    pub currency: String,
    pub note: Option<String>,
    pub device_name: Option<String>,
    pub spending_time: DateTime<Utc>,
    pub occurrence_key: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cadence, NewRule, RuleTemplate};
    use chrono::TimeZone;
    use std::num::NonZeroU32;

    #[test]
    fn test_from_rule_copies_template() {
        let scheduled = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let executed = Utc.with_ymd_and_hms(2025, 1, 3, 14, 5, 0).unwrap();
        let rule = NewRule::new(
            Cadence::yearly(NonZeroU32::new(1).unwrap()),
            RuleTemplate {
                amount: 99.0,
                category: "insurance".to_string(),
                currency: "GBP".to_string(),
                note: Some("car".to_string()),
                device_name: Some("phone".to_string()),
            },
        )
        .first_run_at(scheduled)
        .into_rule(scheduled);

        let entry = NewLedgerEntry::from_rule(&rule, executed);
        assert_eq!(entry.rule_id, rule.id);
        assert_eq!(entry.amount, 99.0);
        assert_eq!(entry.category, "insurance");
        assert_eq!(entry.currency, "GBP");
        assert_eq!(entry.note.as_deref(), Some("car"));
        assert_eq!(entry.spending_time, executed);
        assert_eq!(entry.occurrence_key, occurrence_key(&rule.id, scheduled));

        let recorded = entry.clone().into_entry();
        assert!(recorded.id.starts_with("txn-"));
        assert_eq!(recorded.spending_time, executed);
    }
}
