//! Cadence types: how often a rule repeats and what it anchors on.
//!
//! The persisted form is flat (`frequency_type` plus optional anchor columns);
//! in memory the anchor lives inside the frequency variant so a weekly rule
//! without a weekday cannot be constructed.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// The flat frequency tag stored in `frequency_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyType {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FrequencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyType::Daily => "daily",
            FrequencyType::Weekly => "weekly",
            FrequencyType::Monthly => "monthly",
            FrequencyType::Yearly => "yearly",
        }
    }
}

impl fmt::Display for FrequencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrequencyType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(FrequencyType::Daily),
            "weekly" => Ok(FrequencyType::Weekly),
            "monthly" => Ok(FrequencyType::Monthly),
            "yearly" => Ok(FrequencyType::Yearly),
            other => Err(SchedulerError::InvalidRule(format!("unknown frequency type '{}'", other))),
        }
    }
}

/// Day of month in 1..=31
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayOfMonth(u8);

impl DayOfMonth {
    pub fn new(day: u32) -> Result<Self> {
        if (1..=31).contains(&day) {
            Ok(Self(day as u8))
        } else {
            Err(SchedulerError::InvalidRule(format!(
                "monthly_day_of_month must be 1-31, got {}",
                day
            )))
        }
    }

    pub fn get(self) -> u32 {
        u32::from(self.0)
    }
}

/// What a monthly rule lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthlyAnchor {
    /// A fixed day, clamped to the month's length
    FixedDay(DayOfMonth),
    /// The last calendar day of the month
    LastDay,
}

/// Frequency with its anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly { weekday: Weekday },
    Monthly { anchor: MonthlyAnchor },
    Yearly,
}

impl Frequency {
    pub fn frequency_type(&self) -> FrequencyType {
        match self {
            Frequency::Daily => FrequencyType::Daily,
            Frequency::Weekly { .. } => FrequencyType::Weekly,
            Frequency::Monthly { .. } => FrequencyType::Monthly,
            Frequency::Yearly => FrequencyType::Yearly,
        }
    }
}

/// Complete cadence: frequency, anchor and interval multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub interval: NonZeroU32,
    pub frequency: Frequency,
}

/// The persisted cadence columns, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CadenceFields {
    pub frequency_type: String,
    pub interval_value: i64,
    pub weekly_day_of_week: Option<i64>,
    pub monthly_day_of_month: Option<i64>,
    pub is_last_day_of_month: Option<bool>,
}

impl Cadence {
    pub fn daily(interval: NonZeroU32) -> Self {
        Self {
            interval,
            frequency: Frequency::Daily,
        }
    }

    pub fn weekly(interval: NonZeroU32, weekday: Weekday) -> Self {
        Self {
            interval,
            frequency: Frequency::Weekly { weekday },
        }
    }

    pub fn monthly_on(interval: NonZeroU32, day: DayOfMonth) -> Self {
        Self {
            interval,
            frequency: Frequency::Monthly {
                anchor: MonthlyAnchor::FixedDay(day),
            },
        }
    }

    pub fn monthly_last_day(interval: NonZeroU32) -> Self {
        Self {
            interval,
            frequency: Frequency::Monthly {
                anchor: MonthlyAnchor::LastDay,
            },
        }
    }

    pub fn yearly(interval: NonZeroU32) -> Self {
        Self {
            interval,
            frequency: Frequency::Yearly,
        }
    }

    /// Build a cadence from the flat persisted columns.
    ///
    /// Anchors that do not belong to the frequency are ignored; a missing or
    /// out-of-range anchor that the frequency needs is an `InvalidRule`.
    pub fn from_fields(fields: &CadenceFields) -> Result<Self> {
        let interval = u32::try_from(fields.interval_value)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                SchedulerError::InvalidRule(format!(
                    "interval_value must be a positive integer, got {}",
                    fields.interval_value
                ))
            })?;

        let frequency = match fields.frequency_type.parse::<FrequencyType>()? {
            FrequencyType::Daily => Frequency::Daily,
            FrequencyType::Yearly => Frequency::Yearly,
            FrequencyType::Weekly => {
                let day = fields.weekly_day_of_week.ok_or_else(|| {
                    SchedulerError::InvalidRule("weekly rule requires weekly_day_of_week".to_string())
                })?;
                Frequency::Weekly {
                    weekday: weekday_from_number(day)?,
                }
            }
            FrequencyType::Monthly => {
                let anchor = if fields.is_last_day_of_month.unwrap_or(false) {
                    MonthlyAnchor::LastDay
                } else {
                    let day = fields.monthly_day_of_month.ok_or_else(|| {
                        SchedulerError::InvalidRule(
                            "monthly rule requires monthly_day_of_month or is_last_day_of_month".to_string(),
                        )
                    })?;
                    let day = u32::try_from(day).map_err(|_| {
                        SchedulerError::InvalidRule(format!("monthly_day_of_month must be 1-31, got {}", day))
                    })?;
                    MonthlyAnchor::FixedDay(DayOfMonth::new(day)?)
                };
                Frequency::Monthly { anchor }
            }
        };

        Ok(Self { interval, frequency })
    }

    /// Flatten back into the persisted columns.
    pub fn to_fields(&self) -> CadenceFields {
        let mut fields = CadenceFields {
            frequency_type: self.frequency.frequency_type().as_str().to_string(),
            interval_value: i64::from(self.interval.get()),
            ..Default::default()
        };
        match self.frequency {
            Frequency::Weekly { weekday } => {
                fields.weekly_day_of_week = Some(i64::from(weekday.number_from_monday()));
            }
            Frequency::Monthly { anchor } => match anchor {
                MonthlyAnchor::FixedDay(day) => {
                    fields.monthly_day_of_month = Some(i64::from(day.get()));
                    fields.is_last_day_of_month = Some(false);
                }
                MonthlyAnchor::LastDay => {
                    fields.is_last_day_of_month = Some(true);
                }
            },
            Frequency::Daily | Frequency::Yearly => {}
        }
        fields
    }

    /// Human-readable summary, e.g. "every 2 weeks on Wed".
    pub fn describe(&self) -> String {
        let n = self.interval.get();
        let unit = |singular: &str| {
            if n == 1 {
                format!("every {}", singular)
            } else {
                format!("every {} {}s", n, singular)
            }
        };
        match self.frequency {
            Frequency::Daily => unit("day"),
            Frequency::Weekly { weekday } => format!("{} on {}", unit("week"), weekday),
            Frequency::Monthly {
                anchor: MonthlyAnchor::FixedDay(day),
            } => format!("{} on day {}", unit("month"), day.get()),
            Frequency::Monthly {
                anchor: MonthlyAnchor::LastDay,
            } => format!("{} on the last day", unit("month")),
            Frequency::Yearly => unit("year"),
        }
    }
}

/// 1 = Monday .. 7 = Sunday
pub fn weekday_from_number(day: i64) -> Result<Weekday> {
    match day {
        1 => Ok(Weekday::Mon),
        2 => Ok(Weekday::Tue),
        3 => Ok(Weekday::Wed),
        4 => Ok(Weekday::Thu),
        5 => Ok(Weekday::Fri),
        6 => Ok(Weekday::Sat),
        7 => Ok(Weekday::Sun),
        other => Err(SchedulerError::InvalidRule(format!(
            "weekly_day_of_week must be 1-7 (1 = Monday), got {}",
            other
        ))),
    }
}
