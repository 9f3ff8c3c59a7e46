//! In-memory RuleStore, for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::traits::{RuleStore, sort_due};
use crate::domain::{RecurrenceRule, RulePatch};
use crate::error::{Result, SchedulerError};

/// RuleStore backed by a `BTreeMap`.
///
/// `fail_next_updates` makes the next N `update` calls fail with a
/// `Persistence` error, which lets callers exercise their failure paths.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<BTreeMap<String, RecurrenceRule>>,
    failing_updates: AtomicU32,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing rules, keeping their IDs.
    pub fn with_rules(rules: impl IntoIterator<Item = RecurrenceRule>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.rules.lock() {
            for rule in rules {
                map.insert(rule.id.clone(), rule);
            }
        }
        store
    }

    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, RecurrenceRule>>> {
        self.rules.lock().map_err(|e| SchedulerError::Persistence(e.to_string()))
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn create(&self, rule: RecurrenceRule) -> Result<RecurrenceRule> {
        let mut rules = self.lock()?;
        if rules.contains_key(&rule.id) {
            return Err(SchedulerError::Conflict(format!("rule {} already exists", rule.id)));
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    async fn get(&self, id: &str) -> Result<Option<RecurrenceRule>> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: RulePatch) -> Result<RecurrenceRule> {
        let failing = self.failing_updates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_updates.store(failing - 1, Ordering::SeqCst);
            return Err(SchedulerError::Persistence(format!("injected failure updating {}", id)));
        }

        let mut rules = self.lock()?;
        let rule = rules.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        patch.apply(rule)?;
        Ok(rule.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.lock()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    async fn list_all(&self) -> Result<Vec<RecurrenceRule>> {
        let mut all: Vec<RecurrenceRule> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<RecurrenceRule>> {
        let mut due: Vec<RecurrenceRule> = self.lock()?.values().filter(|r| r.is_due(now)).cloned().collect();
        sort_due(&mut due);
        Ok(due)
    }
}
