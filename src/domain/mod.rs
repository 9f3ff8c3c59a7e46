//! Domain types for the recurring-transaction scheduler.
//!
//! - `Cadence`: frequency, interval and anchor of a rule
//! - `RecurrenceRule`: the persisted rule with its runtime schedule and template
//! - `NewRule` / `RulePatch`: create and partial-update inputs

mod cadence;
mod rule;

pub use cadence::{Cadence, CadenceFields, DayOfMonth, Frequency, FrequencyType, MonthlyAnchor, weekday_from_number};
pub use rule::{NewRule, RecurrenceRule, RulePatch, RuleStatus, RuleTemplate};
