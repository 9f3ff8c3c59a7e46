//! Recurrence rule record and the inputs used to create and modify it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::cadence::{Cadence, CadenceFields};
use crate::error::{Result, SchedulerError};
use crate::id::{generate_rule_id, now_ms};

/// Whether a rule takes part in due-discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Active,
    Paused,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RuleStatus::Active),
            "paused" => Ok(RuleStatus::Paused),
            other => Err(SchedulerError::InvalidRule(format!("unknown status '{}'", other))),
        }
    }
}

/// Payload copied into every ledger entry the rule materializes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub amount: f64,
    pub category: String,
    pub currency: String,
    pub note: Option<String>,
    pub device_name: Option<String>,
}

/// A recurring transaction rule.
///
/// Serializes to the flat column layout the backend uses; deserializing a
/// row with inconsistent cadence columns fails with `InvalidRule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleRow", into = "RuleRow")]
pub struct RecurrenceRule {
    pub id: String,
    pub cadence: Cadence,

    /// Advisory bounds, not enforced by the calculator
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub timezone: Option<String>,

    /// When the rule is next due
    pub next_run_at: DateTime<Utc>,
    /// Set only by a successful execute
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: RuleStatus,

    pub template: RuleTemplate,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Unix timestamp in milliseconds
    pub updated_at: i64,
}

impl RecurrenceRule {
    /// Active and scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RuleStatus::Active && self.next_run_at <= now
    }

    /// True when the advisory end date lies before `at`.
    pub fn has_ended(&self, at: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end < at.date_naive())
    }

    /// Update the timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Flat storage row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleRow {
    id: String,
    frequency_type: String,
    interval_value: i64,
    #[serde(default)]
    weekly_day_of_week: Option<i64>,
    #[serde(default)]
    monthly_day_of_month: Option<i64>,
    #[serde(default)]
    is_last_day_of_month: Option<bool>,
    #[serde(default)]
    start_date: Option<NaiveDate>,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    timezone: Option<String>,
    next_run_at: DateTime<Utc>,
    #[serde(default)]
    last_run_at: Option<DateTime<Utc>>,
    status: RuleStatus,
    amount: f64,
    category: String,
    currency: String,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: i64,
}

impl TryFrom<RuleRow> for RecurrenceRule {
    type Error = SchedulerError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let cadence = Cadence::from_fields(&CadenceFields {
            frequency_type: row.frequency_type,
            interval_value: row.interval_value,
            weekly_day_of_week: row.weekly_day_of_week,
            monthly_day_of_month: row.monthly_day_of_month,
            is_last_day_of_month: row.is_last_day_of_month,
        })
        .map_err(|e| match e {
            SchedulerError::InvalidRule(msg) => SchedulerError::InvalidRule(format!("rule {}: {}", row.id, msg)),
            other => other,
        })?;

        Ok(Self {
            id: row.id,
            cadence,
            start_date: row.start_date,
            end_date: row.end_date,
            timezone: row.timezone,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            status: row.status,
            template: RuleTemplate {
                amount: row.amount,
                category: row.category,
                currency: row.currency,
                note: row.note,
                device_name: row.device_name,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<RecurrenceRule> for RuleRow {
    fn from(rule: RecurrenceRule) -> Self {
        let fields = rule.cadence.to_fields();
        Self {
            id: rule.id,
            frequency_type: fields.frequency_type,
            interval_value: fields.interval_value,
            weekly_day_of_week: fields.weekly_day_of_week,
            monthly_day_of_month: fields.monthly_day_of_month,
            is_last_day_of_month: fields.is_last_day_of_month,
            start_date: rule.start_date,
            end_date: rule.end_date,
            timezone: rule.timezone,
            next_run_at: rule.next_run_at,
            last_run_at: rule.last_run_at,
            status: rule.status,
            amount: rule.template.amount,
            category: rule.template.category,
            currency: rule.template.currency,
            note: rule.template.note,
            device_name: rule.template.device_name,
            created_at: rule.created_at,
            updated_at: rule.updated_at,
        }
    }
}

/// Input for creating a rule
#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub cadence: Cadence,
    pub template: RuleTemplate,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub timezone: Option<String>,
    /// First due instant; defaults to midnight UTC of `start_date`, else creation time
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: RuleStatus,
}

impl NewRule {
    pub fn new(cadence: Cadence, template: RuleTemplate) -> Self {
        Self {
            cadence,
            template,
            start_date: None,
            end_date: None,
            timezone: None,
            next_run_at: None,
            status: RuleStatus::Active,
        }
    }

    pub fn starting(mut self, start_date: NaiveDate) -> Self {
        self.start_date = Some(start_date);
        self
    }

    pub fn ending(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn first_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Materialize into a stored rule with a fresh ID.
    pub fn into_rule(self, now: DateTime<Utc>) -> RecurrenceRule {
        let next_run_at = self.next_run_at.unwrap_or_else(|| match self.start_date {
            Some(date) => date.and_time(NaiveTime::MIN).and_utc(),
            None => now,
        });
        let ts = now.timestamp_millis();
        RecurrenceRule {
            id: generate_rule_id(),
            cadence: self.cadence,
            start_date: self.start_date,
            end_date: self.end_date,
            timezone: self.timezone,
            next_run_at,
            last_run_at: None,
            status: self.status,
            template: self.template,
            created_at: ts,
            updated_at: ts,
        }
    }
}

/// Partial update applied by `RuleStore::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RulePatch {
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: Option<RuleStatus>,
    pub cadence: Option<Cadence>,
    pub template: Option<RuleTemplate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub timezone: Option<String>,

    /// Compare-and-swap guard: when set, the update only applies if the
    /// stored `next_run_at` still equals this value
    pub expected_next_run_at: Option<DateTime<Utc>>,
}

impl RulePatch {
    /// Reschedule only (skip / defer).
    pub fn reschedule(next_run_at: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(next_run_at),
            ..Default::default()
        }
    }

    /// Record a run and reschedule (execute).
    pub fn executed(ran_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(next_run_at),
            last_run_at: Some(ran_at),
            ..Default::default()
        }
    }

    pub fn status(status: RuleStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Require the stored `next_run_at` to be unchanged.
    pub fn guarded(mut self, expected_next_run_at: DateTime<Utc>) -> Self {
        self.expected_next_run_at = Some(expected_next_run_at);
        self
    }

    /// Merge into `rule`, enforcing the guard first.
    ///
    /// A paused rule keeps its `next_run_at` unless the same patch
    /// reactivates it.
    pub fn apply(&self, rule: &mut RecurrenceRule) -> Result<()> {
        if let Some(expected) = self.expected_next_run_at
            && rule.next_run_at != expected
        {
            return Err(SchedulerError::Conflict(format!(
                "rule {} next_run_at is {}, expected {}",
                rule.id, rule.next_run_at, expected
            )));
        }
        if rule.status == RuleStatus::Paused
            && self.next_run_at.is_some()
            && self.status != Some(RuleStatus::Active)
        {
            return Err(SchedulerError::Conflict(format!(
                "rule {} is paused, its schedule cannot advance",
                rule.id
            )));
        }

        if let Some(next_run_at) = self.next_run_at {
            rule.next_run_at = next_run_at;
        }
        if let Some(last_run_at) = self.last_run_at {
            rule.last_run_at = Some(last_run_at);
        }
        if let Some(status) = self.status {
            rule.status = status;
        }
        if let Some(cadence) = self.cadence {
            rule.cadence = cadence;
        }
        if let Some(template) = &self.template {
            rule.template = template.clone();
        }
        if let Some(start_date) = self.start_date {
            rule.start_date = Some(start_date);
        }
        if let Some(end_date) = self.end_date {
            rule.end_date = Some(end_date);
        }
        if let Some(timezone) = &self.timezone {
            rule.timezone = Some(timezone.clone());
        }
        rule.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cadence::DayOfMonth;
    use chrono::{TimeZone, Weekday};
    use std::num::NonZeroU32;

    fn template() -> RuleTemplate {
        RuleTemplate {
            amount: 12.5,
            category: "subscriptions".to_string(),
            currency: "USD".to_string(),
            note: Some("music".to_string()),
            device_name: None,
        }
    }

    fn weekly_rule() -> RecurrenceRule {
        NewRule::new(Cadence::weekly(NonZeroU32::new(1).unwrap(), Weekday::Wed), template())
            .first_run_at(Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap())
            .into_rule(Utc::now())
    }

    #[test]
    fn test_serializes_with_persisted_field_names() {
        let rule = weekly_rule();
        let value = serde_json::to_value(&rule).unwrap();

        assert_eq!(value["frequency_type"], "weekly");
        assert_eq!(value["interval_value"], 1);
        assert_eq!(value["weekly_day_of_week"], 3);
        assert!(value["monthly_day_of_month"].is_null());
        assert_eq!(value["status"], "active");
        assert_eq!(value["category"], "subscriptions");
        assert!(value.get("next_run_at").is_some());
        assert!(value.get("last_run_at").is_some());
        assert!(value.get("cadence").is_none());
    }

    #[test]
    fn test_deserialize_back() {
        let rule = weekly_rule();
        let json = serde_json::to_string(&rule).unwrap();
        let restored: RecurrenceRule = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, rule);
    }

    #[test]
    fn test_deserialize_rejects_weekly_without_weekday() {
        let json = r#"{
            "id": "rule-1",
            "frequency_type": "weekly",
            "interval_value": 1,
            "next_run_at": "2025-01-15T09:00:00Z",
            "status": "active",
            "amount": 10.0,
            "category": "food",
            "currency": "EUR"
        }"#;
        let err = serde_json::from_str::<RecurrenceRule>(json).unwrap_err();
        assert!(err.to_string().contains("weekly_day_of_week"));
    }

    #[test]
    fn test_new_rule_defaults_next_run_to_start_date() {
        let rule = NewRule::new(Cadence::daily(NonZeroU32::new(1).unwrap()), template())
            .starting(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
            .into_rule(Utc::now());
        assert_eq!(rule.next_run_at, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(rule.status, RuleStatus::Active);
        assert!(rule.last_run_at.is_none());
    }

    #[test]
    fn test_new_rule_defaults_next_run_to_now() {
        let now = Utc.with_ymd_and_hms(2025, 5, 5, 12, 0, 0).unwrap();
        let rule = NewRule::new(Cadence::daily(NonZeroU32::new(1).unwrap()), template()).into_rule(now);
        assert_eq!(rule.next_run_at, now);
    }

    #[test]
    fn test_is_due() {
        let mut rule = weekly_rule();
        let at = rule.next_run_at;
        assert!(rule.is_due(at));
        assert!(!rule.is_due(at - chrono::Duration::seconds(1)));

        rule.status = RuleStatus::Paused;
        assert!(!rule.is_due(at));
    }

    #[test]
    fn test_has_ended() {
        let mut rule = weekly_rule();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(!rule.has_ended(at));
        rule.end_date = NaiveDate::from_ymd_opt(2025, 5, 31);
        assert!(rule.has_ended(at));
        rule.end_date = NaiveDate::from_ymd_opt(2025, 6, 1);
        assert!(!rule.has_ended(at));
    }

    #[test]
    fn test_patch_applies_fields() {
        let mut rule = weekly_rule();
        let ran = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2025, 1, 22, 10, 0, 0).unwrap();

        RulePatch::executed(ran, next).apply(&mut rule).unwrap();
        assert_eq!(rule.last_run_at, Some(ran));
        assert_eq!(rule.next_run_at, next);

        let monthly = Cadence::monthly_on(NonZeroU32::new(1).unwrap(), DayOfMonth::new(5).unwrap());
        let patch = RulePatch {
            cadence: Some(monthly),
            status: Some(RuleStatus::Paused),
            ..Default::default()
        };
        patch.apply(&mut rule).unwrap();
        assert_eq!(rule.cadence, monthly);
        assert_eq!(rule.status, RuleStatus::Paused);
        // Untouched by the second patch
        assert_eq!(rule.last_run_at, Some(ran));
    }

    #[test]
    fn test_patch_guard_conflict() {
        let mut rule = weekly_rule();
        let original = rule.next_run_at;
        let next = original + chrono::Duration::days(7);

        let stale = RulePatch::reschedule(next).guarded(original - chrono::Duration::days(7));
        let err = stale.apply(&mut rule).unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
        assert_eq!(rule.next_run_at, original);

        RulePatch::reschedule(next).guarded(original).apply(&mut rule).unwrap();
        assert_eq!(rule.next_run_at, next);
    }

    #[test]
    fn test_patch_refuses_to_move_paused_rule() {
        let mut rule = weekly_rule();
        rule.status = RuleStatus::Paused;
        let original = rule.next_run_at;
        let next = original + chrono::Duration::days(7);

        let err = RulePatch::reschedule(next).apply(&mut rule).unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
        assert_eq!(rule.next_run_at, original);

        let err = RulePatch::executed(next, next).apply(&mut rule).unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
        assert_eq!(rule.last_run_at, None);

        // Status-only changes still apply
        RulePatch::status(RuleStatus::Active).apply(&mut rule).unwrap();
        assert_eq!(rule.next_run_at, original);

        rule.status = RuleStatus::Paused;
        let reactivate = RulePatch {
            status: Some(RuleStatus::Active),
            next_run_at: Some(next),
            ..Default::default()
        };
        reactivate.apply(&mut rule).unwrap();
        assert_eq!(rule.next_run_at, next);
        assert_eq!(rule.status, RuleStatus::Active);
    }

    #[test]
    fn test_into_rule_stamps_injected_instant() {
        let now = Utc.with_ymd_and_hms(2031, 3, 9, 7, 30, 0).unwrap();
        let rule = NewRule::new(Cadence::daily(NonZeroU32::new(1).unwrap()), template()).into_rule(now);
        assert_eq!(rule.created_at, now.timestamp_millis());
        assert_eq!(rule.updated_at, now.timestamp_millis());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("active".parse::<RuleStatus>().unwrap(), RuleStatus::Active);
        assert_eq!("paused".parse::<RuleStatus>().unwrap(), RuleStatus::Paused);
        assert!("deleted".parse::<RuleStatus>().is_err());
    }
}
