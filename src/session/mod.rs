//! Due-rule review workflow.
//!
//! A `DueRuleSession` walks a snapshot of due rules one at a time. For each
//! presented rule the caller chooses:
//! - **execute**: append a ledger entry, then record the run and reschedule
//! - **skip** / **defer**: reschedule from now without a ledger entry
//! - **dismiss**: stop presenting; remaining rules stay due
//!
//! # Lifecycle
//!
//! ```text
//! Idle --offer(non-empty)--> Presenting { items, cursor: 0 }
//! Presenting --advance past last item--> Idle
//! Presenting --dismiss--> Idle
//! ```
//!
//! Execute holds the cursor when a write fails so the same rule can be
//! retried; skip and defer always move on.

use std::sync::Arc;

use crate::calculator::compute_next_run_at;
use crate::clock::Clock;
use crate::domain::{RecurrenceRule, RulePatch, RuleStatus};
use crate::error::{Result, SchedulerError};
use crate::ledger::{LedgerSink, NewLedgerEntry};
use crate::store::RuleStore;

/// Behaviour switches for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Re-read each rule before executing it and make every schedule update
    /// (execute, skip, defer) conditional on `next_run_at` being unchanged.
    /// A rule that moved, was paused or was deleted since the snapshot is
    /// passed over.
    pub guard_concurrent_execute: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            guard_concurrent_execute: true,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    /// `cursor < items.len()` always holds here
    Presenting { items: Vec<RecurrenceRule>, cursor: usize },
}

/// Result of offering a due-discovery result to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// A new session opened over this many rules
    Opened(usize),
    /// A session is already being presented; the result was ignored
    AlreadyPresenting,
    /// Nothing is due
    NothingDue,
}

/// Result of an action on the presented rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Moved on to the rule at `cursor`
    Advanced { cursor: usize },
    /// That was the last rule; the session is idle again
    Closed,
    /// The action failed and the same rule stays presented
    Held { reason: String },
}

/// Review session over a snapshot of due rules.
pub struct DueRuleSession<S, L>
where
    S: RuleStore,
    L: LedgerSink,
{
    store: Arc<S>,
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    state: Lifecycle,
}

impl<S, L> DueRuleSession<S, L>
where
    S: RuleStore,
    L: LedgerSink,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, ledger, clock, SessionConfig::default())
    }

    pub fn with_config(store: Arc<S>, ledger: Arc<L>, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            store,
            ledger,
            clock,
            config,
            state: Lifecycle::Idle,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.state
    }

    pub fn is_visible(&self) -> bool {
        matches!(self.state, Lifecycle::Presenting { .. })
    }

    /// Index of the presented rule; 0 when idle.
    pub fn cursor(&self) -> usize {
        match &self.state {
            Lifecycle::Presenting { cursor, .. } => *cursor,
            Lifecycle::Idle => 0,
        }
    }

    /// The snapshot being presented; empty when idle.
    pub fn items(&self) -> &[RecurrenceRule] {
        match &self.state {
            Lifecycle::Presenting { items, .. } => items,
            Lifecycle::Idle => &[],
        }
    }

    /// The rule currently presented.
    pub fn current(&self) -> Option<&RecurrenceRule> {
        match &self.state {
            Lifecycle::Presenting { items, cursor } => items.get(*cursor),
            Lifecycle::Idle => None,
        }
    }

    /// 1-based position and total, e.g. `(2, 5)`.
    pub fn position(&self) -> Option<(usize, usize)> {
        match &self.state {
            Lifecycle::Presenting { items, cursor } => Some((cursor + 1, items.len())),
            Lifecycle::Idle => None,
        }
    }

    /// Offer a due-discovery result.
    ///
    /// Opens a session when idle and `due` is non-empty. A session already
    /// being presented is never re-snapshotted.
    pub fn offer(&mut self, due: Vec<RecurrenceRule>) -> Offer {
        if self.is_visible() {
            tracing::debug!(discovered = due.len(), "Session already presenting, ignoring discovery");
            return Offer::AlreadyPresenting;
        }
        if due.is_empty() {
            return Offer::NothingDue;
        }

        let count = due.len();
        tracing::info!(count, "Opening due-rule session");
        self.state = Lifecycle::Presenting { items: due, cursor: 0 };
        Offer::Opened(count)
    }

    /// Run due-discovery against the store and offer the result.
    pub async fn refresh(&mut self) -> Result<Offer> {
        let now = self.clock.now();
        let due = self.store.list_due(now).await?;
        Ok(self.offer(due))
    }

    /// Materialize the presented rule and reschedule it.
    ///
    /// Returns `Err` only when there is no session or the next occurrence
    /// cannot be computed; nothing is written in either case. Write
    /// failures come back as `Transition::Held`.
    pub async fn execute(&mut self) -> Result<Transition> {
        let item = self.current().cloned().ok_or(SchedulerError::NoActiveSession)?;
        let now = self.clock.now();

        let next = compute_next_run_at(&item.cadence, now).inspect_err(|e| {
            tracing::error!(rule_id = %item.id, error = %e, "Cannot schedule rule");
        })?;

        if self.config.guard_concurrent_execute {
            match self.store.get(&item.id).await {
                Ok(Some(stored)) if stored.status == RuleStatus::Active && stored.next_run_at == item.next_run_at => {}
                Ok(Some(stored)) => {
                    tracing::info!(
                        rule_id = %item.id,
                        status = %stored.status,
                        next_run_at = %stored.next_run_at,
                        "Rule changed since discovery, passing over"
                    );
                    return Ok(self.advance());
                }
                Ok(None) => {
                    tracing::warn!(rule_id = %item.id, "Rule no longer exists, passing over");
                    return Ok(self.advance());
                }
                Err(e) => return Ok(self.hold(&item, "re-read", e)),
            }
        }

        let entry = NewLedgerEntry::from_rule(&item, now);
        if let Err(e) = self.ledger.append(entry).await {
            return Ok(self.hold(&item, "ledger append", e));
        }

        let mut patch = RulePatch::executed(now, next);
        if self.config.guard_concurrent_execute {
            patch = patch.guarded(item.next_run_at);
        }

        match self.store.update(&item.id, patch).await {
            Ok(_) => {
                tracing::info!(rule_id = %item.id, next_run_at = %next, "Executed rule");
                Ok(self.advance())
            }
            Err(e @ (SchedulerError::NotFound(_) | SchedulerError::Conflict(_))) => {
                tracing::warn!(rule_id = %item.id, error = %e, "Rule changed during execute, moving on");
                Ok(self.advance())
            }
            Err(e) => Ok(self.hold(&item, "schedule update", e)),
        }
    }

    /// Pass over the presented rule, rescheduling it from now.
    ///
    /// Best effort: the cursor advances even if the reschedule fails, so
    /// the rule may be due again sooner than its cadence implies.
    pub async fn skip(&mut self) -> Result<Transition> {
        self.reschedule("skip").await
    }

    /// "Handle later": same contract as `skip`.
    pub async fn defer(&mut self) -> Result<Transition> {
        self.reschedule("defer").await
    }

    /// Stop presenting without touching the remaining rules.
    ///
    /// Returns false if nothing was being presented.
    pub fn dismiss(&mut self) -> bool {
        let was_visible = self.is_visible();
        if was_visible {
            tracing::info!(cursor = self.cursor(), remaining = self.remaining(), "Session dismissed");
        }
        self.state = Lifecycle::Idle;
        was_visible
    }

    /// Rules not yet acted on, including the presented one.
    pub fn remaining(&self) -> usize {
        match &self.state {
            Lifecycle::Presenting { items, cursor } => items.len() - cursor,
            Lifecycle::Idle => 0,
        }
    }

    // Recomputes from now, not from the rule's own next_run_at, so repeated
    // skips drift the anchor.
    async fn reschedule(&mut self, action: &'static str) -> Result<Transition> {
        let item = self.current().cloned().ok_or(SchedulerError::NoActiveSession)?;
        let now = self.clock.now();

        match compute_next_run_at(&item.cadence, now) {
            Ok(next) => {
                let mut patch = RulePatch::reschedule(next);
                if self.config.guard_concurrent_execute {
                    patch = patch.guarded(item.next_run_at);
                }
                match self.store.update(&item.id, patch).await {
                    Ok(_) => tracing::info!(rule_id = %item.id, action, next_run_at = %next, "Rescheduled rule"),
                    Err(SchedulerError::NotFound(_)) => {
                        tracing::warn!(rule_id = %item.id, action, "Rule no longer exists")
                    }
                    Err(e @ SchedulerError::Conflict(_)) => {
                        tracing::info!(rule_id = %item.id, action, reason = %e, "Rule changed since discovery, passing over")
                    }
                    Err(e) => tracing::warn!(rule_id = %item.id, action, error = %e, "Reschedule failed, moving on"),
                }
            }
            Err(e) => tracing::error!(rule_id = %item.id, action, error = %e, "Cannot schedule rule, moving on"),
        }

        Ok(self.advance())
    }

    fn hold(&self, item: &RecurrenceRule, step: &str, error: SchedulerError) -> Transition {
        tracing::error!(rule_id = %item.id, step, error = %error, "Execute failed, keeping rule presented");
        Transition::Held {
            reason: format!("{} failed: {}", step, error),
        }
    }

    fn advance(&mut self) -> Transition {
        let transition = match &mut self.state {
            Lifecycle::Presenting { items, cursor } if *cursor + 1 < items.len() => {
                *cursor += 1;
                Transition::Advanced { cursor: *cursor }
            }
            _ => Transition::Closed,
        };
        if transition == Transition::Closed {
            tracing::info!("Session complete");
            self.state = Lifecycle::Idle;
        }
        transition
    }
}
