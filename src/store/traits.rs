//! RuleStore trait: the persistence boundary for recurrence rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{RecurrenceRule, RulePatch, RuleStatus};
use crate::error::Result;

/// Persistence for recurrence rules.
///
/// Each call is atomic for a single rule; nothing spans several rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a new rule. Fails with `Conflict` if the ID is taken.
    async fn create(&self, rule: RecurrenceRule) -> Result<RecurrenceRule>;

    /// Get a rule by ID.
    async fn get(&self, id: &str) -> Result<Option<RecurrenceRule>>;

    /// Merge `patch` into the stored rule and persist it.
    ///
    /// Fails with `NotFound` for an unknown ID and with `Conflict` when the
    /// patch carries an `expected_next_run_at` that no longer matches.
    async fn update(&self, id: &str, patch: RulePatch) -> Result<RecurrenceRule>;

    /// Delete a rule. Fails with `NotFound` for an unknown ID.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Every rule, oldest first.
    async fn list_all(&self) -> Result<Vec<RecurrenceRule>>;

    /// Active rules with `next_run_at <= now`, earliest due first, ties by ID.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<RecurrenceRule>>;

    /// Stop a rule from being discovered. Its schedule is left untouched.
    async fn pause(&self, id: &str) -> Result<RecurrenceRule> {
        self.update(id, RulePatch::status(RuleStatus::Paused)).await
    }

    /// Make a paused rule discoverable again. An overdue rule is due at once.
    async fn resume(&self, id: &str) -> Result<RecurrenceRule> {
        self.update(id, RulePatch::status(RuleStatus::Active)).await
    }
}

/// Order rules the way `list_due` promises: by `next_run_at`, then ID.
pub fn sort_due(rules: &mut [RecurrenceRule]) {
    rules.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
}
