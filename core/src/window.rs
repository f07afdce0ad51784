//! Window Resolver: turns a configured length into a half-open interval.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FraudError, FraudResult};

/// Half-open interval `[start, end)`. Invariant: `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end:   DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> FraudResult<Self> {
        if start >= end {
            return Err(FraudError::config(format!(
                "window start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> { self.start }
    pub fn end(&self)   -> DateTime<Utc> { self.end }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }
}

/// Resolve a window of `window_days` ending at `now`.
pub fn resolve_window(window_days: i64, now: DateTime<Utc>) -> FraudResult<TimeWindow> {
    if window_days <= 0 {
        return Err(FraudError::config(format!(
            "window length must be a positive number of days, got {window_days}"
        )));
    }
    let length = Duration::try_days(window_days).ok_or_else(|| {
        FraudError::config(format!("window length of {window_days} days is out of range"))
    })?;
    let start = now.checked_sub_signed(length).ok_or_else(|| {
        FraudError::config(format!("window of {window_days} days before {now} is out of range"))
    })?;
    TimeWindow::new(start, now)
}

/// Parse a window length as it arrives from env vars or form fields.
pub fn parse_window_days(raw: &str) -> FraudResult<i64> {
    let days: i64 = raw.trim().parse().map_err(|_| {
        FraudError::config(format!("window length '{raw}' is not an integer"))
    })?;
    if days <= 0 {
        return Err(FraudError::config(format!(
            "window length must be a positive number of days, got {days}"
        )));
    }
    Ok(days)
}

/// Inclusive number of calendar days between two dates, minimum one.
/// This is how a date-range form is mapped onto a trailing window.
pub fn window_days_between(from: NaiveDate, to: NaiveDate) -> FraudResult<i64> {
    if to < from {
        return Err(FraudError::config(format!(
            "end date {to} is before start date {from}"
        )));
    }
    Ok(((to - from).num_days() + 1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn window_spans_exactly_the_configured_days() {
        for days in [1, 7, 30, 90, 365, 3650] {
            let w = resolve_window(days, now()).unwrap();
            assert_eq!(w.end(), now());
            assert_eq!(w.length(), Duration::days(days));
        }
    }

    #[test]
    fn non_positive_lengths_are_rejected() {
        assert!(matches!(resolve_window(0, now()), Err(FraudError::Configuration(_))));
        assert!(matches!(resolve_window(-3, now()), Err(FraudError::Configuration(_))));
        assert!(matches!(resolve_window(i64::MAX, now()), Err(FraudError::Configuration(_))));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_window_days(" 90 ").unwrap(), 90);
        assert!(parse_window_days("ninety").is_err());
        assert!(parse_window_days("0").is_err());
        assert!(parse_window_days("").is_err());
    }

    #[test]
    fn window_is_half_open() {
        let w = resolve_window(7, now()).unwrap();
        assert!(w.contains(w.start()));
        assert!(!w.contains(w.end()));
    }

    #[test]
    fn date_range_is_inclusive() {
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        assert_eq!(window_days_between(d(1, 1), d(1, 1)).unwrap(), 1);
        assert_eq!(window_days_between(d(1, 1), d(1, 31)).unwrap(), 31);
        assert!(window_days_between(d(2, 1), d(1, 1)).is_err());
    }
}
