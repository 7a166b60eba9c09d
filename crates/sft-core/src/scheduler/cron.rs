//! Cron-style field matcher.
//!
//! Each schedule field is an expression over non-negative integers:
//! `*` (every value), a single value, an inclusive range `a-b`, a stepped
//! range `a-b/n` or `*/n`, or a comma-separated list of those. Values above
//! the field maximum are clamped to it.
//!
//! Day-of-week uses Monday = 0 through Sunday = 6.

use chrono::{Datelike, Timelike};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron syntax error in '{expression}': {reason}")]
    Syntax { expression: String, reason: String },

    #[error("cron range error: {0}")]
    Range(String),
}

impl CronError {
    fn syntax(expression: &str, reason: impl Into<String>) -> Self {
        CronError::Syntax {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parsed form of a single cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    /// Matches every value.
    All,
    Values(BTreeSet<u32>),
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        match self {
            CronField::All => true,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

/// Parse `expression` for a field whose values range over `0..=max`.
pub fn parse(expression: &str, max: u32) -> Result<CronField, CronError> {
    parse_bounded(expression, 0, max)
}

/// Like [`parse`], but `*/n` steps start at `min` instead of zero.
pub fn parse_bounded(expression: &str, min: u32, max: u32) -> Result<CronField, CronError> {
    if max == 0 {
        return Err(CronError::Range(format!(
            "maximum must be a positive integer, got {max}"
        )));
    }
    let trimmed = expression.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Ok(CronField::All);
    }

    let mut values = BTreeSet::new();
    for token in trimmed.split(',') {
        let token = token.trim();
        if token == "*" {
            return Ok(CronField::All);
        }
        if token.is_empty() {
            return Err(CronError::syntax(expression, "empty list element"));
        }
        if let Some(bad) = token
            .chars()
            .find(|c| !c.is_ascii_digit() && !matches!(c, '-' | '/' | '*'))
        {
            return Err(CronError::syntax(
                expression,
                format!("unexpected character '{bad}'"),
            ));
        }
        expand_token(expression, token, min, max, &mut values)?;
    }
    Ok(CronField::Values(values))
}

fn expand_token(
    expression: &str,
    token: &str,
    min: u32,
    max: u32,
    out: &mut BTreeSet<u32>,
) -> Result<(), CronError> {
    let (range, step) = match token.split_once('/') {
        Some((range, step)) => (range, Some(number(expression, step)?)),
        None => (token, None),
    };
    if step == Some(0) {
        return Err(CronError::Range(format!(
            "step must be positive in '{expression}'"
        )));
    }

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let a = number(expression, a)?.min(max);
        let b = number(expression, b)?.min(max);
        if a > b {
            return Err(CronError::Range(format!(
                "range start exceeds end in '{expression}'"
            )));
        }
        (a, b)
    } else {
        if step.is_some() {
            return Err(CronError::syntax(expression, "a step needs a range or '*'"));
        }
        let value = number(expression, range)?.min(max);
        (value, value)
    };

    let step = step.unwrap_or(1) as usize;
    out.extend((start..=end).step_by(step));
    Ok(())
}

fn number(expression: &str, text: &str) -> Result<u32, CronError> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(CronError::syntax(
            expression,
            format!("'{text}' is not a number"),
        ));
    }
    // All-digit input only fails on overflow; such values clamp to the maximum.
    Ok(text.parse::<u32>().unwrap_or(u32::MAX))
}

/// The five parsed fields of an SFT schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub minute: CronField,
    pub hour: CronField,
    pub day: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl Schedule {
    pub fn parse(
        minute: &str,
        hour: &str,
        day: &str,
        month: &str,
        day_of_week: &str,
    ) -> Result<Self, CronError> {
        Ok(Self {
            minute: parse_bounded(minute, 0, 59)?,
            hour: parse_bounded(hour, 0, 23)?,
            day: parse_bounded(day, 1, 31)?,
            month: parse_bounded(month, 1, 12)?,
            day_of_week: parse_bounded(day_of_week, 0, 6)?,
        })
    }

    /// True iff every field contains the matching component of `t`.
    pub fn matches<T: Datelike + Timelike>(&self, t: &T) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.day.contains(t.day())
            && self.month.contains(t.month())
            && self
                .day_of_week
                .contains(t.weekday().num_days_from_monday())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn values(field: &CronField) -> Vec<u32> {
        match field {
            CronField::All => panic!("expected explicit values"),
            CronField::Values(v) => v.iter().copied().collect(),
        }
    }

    #[test]
    fn star_matches_every_value() {
        let field = parse("*", 59).unwrap();
        assert!((0..=59).all(|v| field.contains(v)));
        assert_eq!(parse("  ", 59).unwrap(), CronField::All);
    }

    #[test]
    fn lists_ranges_and_steps() {
        assert_eq!(values(&parse("1,3,5", 59).unwrap()), vec![1, 3, 5]);
        assert_eq!(values(&parse("10-13", 59).unwrap()), vec![10, 11, 12, 13]);
        assert_eq!(values(&parse("0-10/5", 59).unwrap()), vec![0, 5, 10]);
        assert_eq!(values(&parse("*/15", 59).unwrap()), vec![0, 15, 30, 45]);
        assert_eq!(values(&parse("1, 2 ,30-31", 59).unwrap()), vec![1, 2, 30, 31]);
    }

    #[test]
    fn values_stay_within_bounds() {
        assert_eq!(values(&parse("70", 59).unwrap()), vec![59]);
        assert_eq!(values(&parse("50-99", 52).unwrap()), vec![50, 51, 52]);
        for v in values(&parse("0-1000/7", 23).unwrap()) {
            assert!(v <= 23);
        }
    }

    #[test]
    fn letters_are_syntax_errors() {
        assert!(matches!(
            parse("1,a,3", 59),
            Err(CronError::Syntax { .. })
        ));
        assert!(matches!(parse("1--2", 59), Err(CronError::Syntax { .. })));
        assert!(matches!(parse("1,,2", 59), Err(CronError::Syntax { .. })));
        assert!(matches!(parse("5/2", 59), Err(CronError::Syntax { .. })));
    }

    #[test]
    fn zero_maximum_is_a_range_error() {
        assert!(matches!(parse("*", 0), Err(CronError::Range(_))));
        assert!(matches!(parse("garbage", 0), Err(CronError::Range(_))));
    }

    #[test]
    fn zero_step_and_reversed_range_are_range_errors() {
        assert!(matches!(parse("*/0", 59), Err(CronError::Range(_))));
        assert!(matches!(parse("30-10", 59), Err(CronError::Range(_))));
    }

    #[test]
    fn stepped_star_starts_at_field_minimum() {
        let days = parse_bounded("*/10", 1, 31).unwrap();
        assert_eq!(values(&days), vec![1, 11, 21, 31]);
    }

    #[test]
    fn schedule_matches_exact_minute() {
        let schedule = Schedule::parse("0", "2", "*", "*", "*").unwrap();
        let at_two = Utc.with_ymd_and_hms(2024, 3, 12, 2, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 12, 2, 1, 0).unwrap();
        assert!(schedule.matches(&at_two));
        assert!(!schedule.matches(&after));
    }

    #[test]
    fn day_of_week_counts_from_monday() {
        let schedule = Schedule::parse("*", "*", "*", "*", "0").unwrap();
        // 2024-03-11 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2024, 3, 11)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let sunday = NaiveDate::from_ymd_opt(2024, 3, 17)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert!(schedule.matches(&monday));
        assert!(!schedule.matches(&sunday));
    }
}
