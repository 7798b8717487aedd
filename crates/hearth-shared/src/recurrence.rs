//! Recurrence rules for scheduled messages.
//!
//! A rule is stored as a plain string next to the scheduled message. Two
//! spellings are accepted:
//!
//! - shorthand: `hourly`, `daily`, `weekly`, `monthly`
//! - JSON: `{"every": 2, "unit": "days"}`
//!
//! [`RecurrenceRule::to_pattern`] always produces the JSON form.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

/// Fixed-interval recurrence: fire every `every` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub every: u32,
    pub unit: RecurrenceUnit,
}

impl RecurrenceRule {
    pub fn new(every: u32, unit: RecurrenceUnit) -> Result<Self, ScheduleError> {
        if every == 0 {
            return Err(ScheduleError::InvalidRecurrence(
                "interval must be at least 1".into(),
            ));
        }
        Ok(Self { every, unit })
    }

    /// The occurrence following `t`, or `None` on calendar overflow.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let n = i64::from(self.every);
        match self.unit {
            RecurrenceUnit::Minutes => t.checked_add_signed(Duration::minutes(n)),
            RecurrenceUnit::Hours => t.checked_add_signed(Duration::hours(n)),
            RecurrenceUnit::Days => t.checked_add_signed(Duration::days(n)),
            RecurrenceUnit::Weeks => t.checked_add_signed(Duration::weeks(n)),
            RecurrenceUnit::Months => t.checked_add_months(Months::new(self.every)),
        }
    }

    pub fn to_pattern(&self) -> String {
        // Serializing two plain fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl FromStr for RecurrenceRule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let shorthand = match trimmed.to_ascii_lowercase().as_str() {
            "hourly" => Some(RecurrenceUnit::Hours),
            "daily" => Some(RecurrenceUnit::Days),
            "weekly" => Some(RecurrenceUnit::Weeks),
            "monthly" => Some(RecurrenceUnit::Months),
            _ => None,
        };
        if let Some(unit) = shorthand {
            return Self::new(1, unit);
        }

        let parsed: RecurrenceRule = serde_json::from_str(trimmed)
            .map_err(|e| ScheduleError::InvalidRecurrence(format!("{trimmed}: {e}")))?;
        Self::new(parsed.every, parsed.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_shorthand_patterns() {
        let rule: RecurrenceRule = "daily".parse().unwrap();
        assert_eq!(rule, RecurrenceRule::new(1, RecurrenceUnit::Days).unwrap());

        let rule: RecurrenceRule = " Weekly ".parse().unwrap();
        assert_eq!(rule.unit, RecurrenceUnit::Weeks);
    }

    #[test]
    fn test_json_pattern() {
        let rule: RecurrenceRule = r#"{"every": 90, "unit": "minutes"}"#.parse().unwrap();
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        assert_eq!(
            rule.next_after(t),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_pattern_roundtrip() {
        let rule = RecurrenceRule::new(3, RecurrenceUnit::Hours).unwrap();
        assert_eq!(rule.to_pattern().parse::<RecurrenceRule>().unwrap(), rule);
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        let rule: RecurrenceRule = "monthly".parse().unwrap();
        let t = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            rule.next_after(t),
            Some(Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_patterns() {
        assert!("fortnightly-ish".parse::<RecurrenceRule>().is_err());
        assert!(r#"{"every": 0, "unit": "days"}"#.parse::<RecurrenceRule>().is_err());
        assert!(r#"{"every": 1, "unit": "years"}"#.parse::<RecurrenceRule>().is_err());
    }
}
