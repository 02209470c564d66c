//! Timing engine: pure next-fire-time computation.
//!
//! The engine never reads clocks; every function takes the reference instant
//! as an argument. Calendar rules are interpreted in the schedule's timezone
//! and returned in UTC. RRULE parts outside the supported subset are refused
//! with an error naming the token, never silently ignored.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use rrule::RRuleSet;
use thiserror::Error;

use super::models::schedule::{EvaluationIntervalUnit, IntervalUnit};

/// RRULE parts the engine understands.
const SUPPORTED_RRULE_PARTS: [&str; 9] = [
    "FREQ",
    "INTERVAL",
    "BYDAY",
    "BYHOUR",
    "BYMINUTE",
    "BYMONTH",
    "BYMONTHDAY",
    "COUNT",
    "UNTIL",
];

#[derive(Debug, Error)]
pub enum TimingError {
    #[error("rrule part '{0}' is not supported")]
    UnsupportedRRulePart(String),

    #[error("invalid rrule: {0}")]
    InvalidRRule(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Validate an RRULE string against the supported RFC-5545 subset.
pub fn validate_rrule(rrule: &str) -> Result<(), TimingError> {
    let body = rrule.trim();
    if body.is_empty() {
        return Err(TimingError::InvalidRRule("empty rule".into()));
    }
    let mut has_freq = false;
    for part in body.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let name = part
            .split_once('=')
            .map(|(name, _)| name)
            .ok_or_else(|| TimingError::InvalidRRule(format!("malformed part '{part}'")))?
            .to_ascii_uppercase();
        if !SUPPORTED_RRULE_PARTS.contains(&name.as_str()) {
            return Err(TimingError::UnsupportedRRulePart(name));
        }
        if name == "FREQ" {
            has_freq = true;
        }
    }
    if !has_freq {
        return Err(TimingError::InvalidRRule("FREQ is required".into()));
    }
    Ok(())
}

/// The smallest `anchor + k * interval > reference` (k >= 0).
///
/// Callers resolve a missing anchor to the schedule's creation time before
/// calling. Month intervals use calendar arithmetic (chrono clamps
/// end-of-month overflow), everything else is a fixed span.
pub fn next_interval(
    interval_count: i32,
    interval_unit: IntervalUnit,
    anchor: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> DateTime<Utc> {
    if anchor > reference {
        return anchor;
    }

    if interval_unit == IntervalUnit::Month {
        return next_month_interval(interval_count, anchor, reference);
    }

    let step = match interval_unit {
        IntervalUnit::Minute => Duration::minutes(interval_count as i64),
        IntervalUnit::Hour => Duration::hours(interval_count as i64),
        IntervalUnit::Day => Duration::days(interval_count as i64),
        IntervalUnit::Week => Duration::weeks(interval_count as i64),
        IntervalUnit::Month => unreachable!(),
    };
    let elapsed = reference - anchor;
    let steps = elapsed.num_seconds() / step.num_seconds() + 1;
    anchor + Duration::seconds(step.num_seconds() * steps)
}

fn next_month_interval(
    interval_count: i32,
    anchor: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> DateTime<Utc> {
    // Start near the right k instead of walking one period at a time.
    let months_elapsed = (reference.year() - anchor.year()) * 12
        + (reference.month() as i32 - anchor.month() as i32);
    let mut k = (months_elapsed / interval_count).max(0);
    loop {
        let months = Months::new((k * interval_count) as u32);
        let candidate = anchor
            .checked_add_months(months)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if candidate > reference {
            return candidate;
        }
        k += 1;
    }
}

/// The next calendar-rule occurrence strictly after `reference`.
///
/// The rule is anchored at `anchor` (callers default it to the reference) and
/// interpreted in `timezone`. Returns `None` when the rule is exhausted
/// (COUNT consumed or UNTIL passed).
pub fn next_calendar(
    rrule: &str,
    anchor: Option<DateTime<Utc>>,
    reference: DateTime<Utc>,
    timezone: &str,
) -> Result<Option<DateTime<Utc>>, TimingError> {
    validate_rrule(rrule)?;
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|_| TimingError::InvalidTimezone(timezone.to_string()))?;

    let dtstart = anchor.unwrap_or(reference);
    let rule = if tz == chrono_tz::UTC {
        format!(
            "DTSTART:{}\nRRULE:{}",
            dtstart.format("%Y%m%dT%H%M%SZ"),
            rrule
        )
    } else {
        format!(
            "DTSTART;TZID={}:{}\nRRULE:{}",
            tz.name(),
            dtstart.with_timezone(&tz).format("%Y%m%dT%H%M%S"),
            rrule
        )
    };

    let rrule_set = rule
        .parse::<RRuleSet>()
        .map_err(|e| TimingError::InvalidRRule(e.to_string()))?;

    // rrule windows are inclusive; shift one second for strictly-after.
    let window_start = (reference + Duration::seconds(1)).with_timezone(&rrule::Tz::UTC);
    let result = rrule_set.after(window_start).all(1);

    Ok(result.dates.first().map(|d| d.with_timezone(&Utc)))
}

/// The next conditional evaluation instant: `reference + cadence`.
pub fn next_conditional_eval(
    interval_count: i32,
    interval_unit: EvaluationIntervalUnit,
    reference: DateTime<Utc>,
) -> DateTime<Utc> {
    let step = match interval_unit {
        EvaluationIntervalUnit::Minute => Duration::minutes(interval_count as i64),
        EvaluationIntervalUnit::Hour => Duration::hours(interval_count as i64),
        EvaluationIntervalUnit::Day => Duration::days(interval_count as i64),
        EvaluationIntervalUnit::Week => Duration::weeks(interval_count as i64),
    };
    reference + step
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_validate_rrule_accepts_subset() {
        assert!(validate_rrule("FREQ=WEEKLY;BYDAY=MO,WE;BYHOUR=9;BYMINUTE=30").is_ok());
        assert!(validate_rrule("FREQ=MONTHLY;BYMONTHDAY=1;COUNT=12").is_ok());
        assert!(validate_rrule("FREQ=DAILY;INTERVAL=2;UNTIL=20260101T000000Z").is_ok());
    }

    #[test]
    fn test_validate_rrule_refuses_unsupported_parts() {
        let err = validate_rrule("FREQ=MONTHLY;BYSETPOS=-1").unwrap_err();
        assert!(matches!(err, TimingError::UnsupportedRRulePart(ref p) if p == "BYSETPOS"));
        let err = validate_rrule("FREQ=WEEKLY;WKST=SU").unwrap_err();
        assert!(matches!(err, TimingError::UnsupportedRRulePart(ref p) if p == "WKST"));
    }

    #[test]
    fn test_validate_rrule_requires_freq() {
        assert!(validate_rrule("INTERVAL=2").is_err());
        assert!(validate_rrule("").is_err());
    }

    #[test]
    fn test_next_interval_steps_from_anchor() {
        let anchor = utc(2025, 2, 6, 10, 0);
        // 90 minutes past the anchor with a 1h step: next boundary is +2h
        let reference = utc(2025, 2, 6, 11, 30);
        let next = next_interval(1, IntervalUnit::Hour, anchor, reference);
        assert_eq!(next, utc(2025, 2, 6, 12, 0));
    }

    #[test]
    fn test_next_interval_future_anchor_fires_at_anchor() {
        let anchor = utc(2025, 3, 1, 0, 0);
        let reference = utc(2025, 2, 6, 10, 0);
        assert_eq!(next_interval(1, IntervalUnit::Day, anchor, reference), anchor);
    }

    #[test]
    fn test_next_interval_exact_boundary_advances() {
        let anchor = utc(2025, 2, 6, 10, 0);
        // Reference exactly on a boundary must yield the *next* one
        let next = next_interval(1, IntervalUnit::Hour, anchor, anchor);
        assert_eq!(next, utc(2025, 2, 6, 11, 0));
    }

    #[test]
    fn test_next_interval_is_monotone() {
        let anchor = utc(2025, 2, 6, 10, 0);
        let reference = utc(2025, 2, 7, 3, 17);
        let first = next_interval(6, IntervalUnit::Hour, anchor, reference);
        let second = next_interval(6, IntervalUnit::Hour, anchor, first);
        assert!(first > reference);
        assert!(second > first);
        assert_eq!(second - first, Duration::hours(6));
    }

    #[test]
    fn test_next_interval_months_clamp_end_of_month() {
        let anchor = utc(2025, 1, 31, 9, 0);
        let reference = utc(2025, 2, 1, 0, 0);
        let next = next_interval(1, IntervalUnit::Month, anchor, reference);
        assert_eq!(next, utc(2025, 2, 28, 9, 0));
    }

    #[test]
    fn test_next_calendar_weekly_in_timezone() {
        // Every Monday 09:00 America/Chicago (CST = UTC-6 in February)
        let anchor = utc(2025, 2, 3, 15, 0);
        let reference = utc(2025, 2, 6, 12, 0);
        let next = next_calendar(
            "FREQ=WEEKLY;BYDAY=MO;BYHOUR=9;BYMINUTE=0",
            Some(anchor),
            reference,
            "America/Chicago",
        )
        .unwrap()
        .unwrap();
        assert_eq!(next, utc(2025, 2, 10, 15, 0));
    }

    #[test]
    fn test_next_calendar_strictly_after_reference() {
        let anchor = utc(2025, 2, 6, 10, 0);
        let next = next_calendar("FREQ=DAILY", Some(anchor), anchor, "UTC")
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2025, 2, 7, 10, 0));
    }

    #[test]
    fn test_next_calendar_count_exhaustion() {
        let anchor = utc(2025, 2, 6, 10, 0);
        let reference = utc(2025, 3, 1, 0, 0);
        // Two daily occurrences, both long past the reference
        let next = next_calendar("FREQ=DAILY;COUNT=2", Some(anchor), reference, "UTC").unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_next_calendar_rejects_unsupported_parts() {
        let err = next_calendar(
            "FREQ=MONTHLY;BYSETPOS=1",
            None,
            utc(2025, 2, 6, 10, 0),
            "UTC",
        )
        .unwrap_err();
        assert!(matches!(err, TimingError::UnsupportedRRulePart(_)));
    }

    #[test]
    fn test_next_calendar_rejects_bad_timezone() {
        let err = next_calendar("FREQ=DAILY", None, utc(2025, 2, 6, 10, 0), "Mars/Olympus")
            .unwrap_err();
        assert!(matches!(err, TimingError::InvalidTimezone(_)));
    }

    #[test]
    fn test_next_conditional_eval_adds_cadence() {
        let reference = utc(2025, 2, 6, 10, 0);
        assert_eq!(
            next_conditional_eval(6, EvaluationIntervalUnit::Hour, reference),
            utc(2025, 2, 6, 16, 0)
        );
        assert_eq!(
            next_conditional_eval(2, EvaluationIntervalUnit::Week, reference),
            utc(2025, 2, 20, 10, 0)
        );
    }
}
