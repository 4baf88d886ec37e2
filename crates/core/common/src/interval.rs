//! Half-open time intervals, written as `start/end` ISO-8601 strings.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Earliest instant representable in a serialized interval (0001-01-01T00:00:00Z).
const ETERNITY_START_MILLIS: i64 = -62_135_596_800_000;
/// Latest instant representable in a serialized interval (9999-12-31T23:59:59.999Z).
const ETERNITY_END_MILLIS: i64 = 253_402_300_799_999;

/// A time interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Interval {
    /// Creates an interval, rejecting an end before the start.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidIntervalError> {
        if end < start {
            return Err(InvalidIntervalError::EndBeforeStart {
                start: format_instant(start),
                end: format_instant(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Creates an interval from epoch milliseconds.
    pub fn from_millis(start: i64, end: i64) -> Result<Self, InvalidIntervalError> {
        let start = DateTime::from_timestamp_millis(start)
            .ok_or(InvalidIntervalError::OutOfRange(start))?;
        let end =
            DateTime::from_timestamp_millis(end).ok_or(InvalidIntervalError::OutOfRange(end))?;
        Self::new(start, end)
    }

    /// The interval covering every instant a segment can hold.
    pub fn eternity() -> Self {
        Self {
            start: DateTime::from_timestamp_millis(ETERNITY_START_MILLIS)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: DateTime::from_timestamp_millis(ETERNITY_END_MILLIS)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether the two intervals share at least one instant.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies entirely within this interval.
    pub fn encloses(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            format_instant(self.start),
            format_instant(self.end)
        )
    }
}

impl FromStr for Interval {
    type Err = InvalidIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('/')
            .ok_or_else(|| InvalidIntervalError::MissingSeparator(s.to_string()))?;
        Self::new(parse_instant(start)?, parse_instant(end)?)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Formats an instant as RFC 3339 with millisecond precision and a `Z` suffix.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an ISO-8601 instant.
///
/// Accepts a full RFC 3339 timestamp, a date-time without offset (taken as UTC) or a bare date
/// (midnight UTC).
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, InvalidIntervalError> {
    let s = s.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
        return Ok(instant.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    Err(InvalidIntervalError::InvalidInstant(s.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidIntervalError {
    #[error("interval '{0}' is missing the '/' separator")]
    MissingSeparator(String),

    #[error("'{0}' is not an ISO-8601 instant")]
    InvalidInstant(String),

    #[error("epoch millisecond value {0} is out of range")]
    OutOfRange(i64),

    #[error("interval end {end} is before its start {start}")]
    EndBeforeStart { start: String, end: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(s: &str) -> Interval {
        s.parse().expect("Failed to parse interval")
    }

    #[test]
    fn parse_accepts_dates_and_timestamps() {
        let day = interval("2013-08-31/2013-09-01");
        assert_eq!(day.to_string(), "2013-08-31T00:00:00.000Z/2013-09-01T00:00:00.000Z");

        let precise = interval("2013-08-31T01:02:33Z/2013-08-31T12:00:00.000+02:00");
        assert_eq!(
            precise.to_string(),
            "2013-08-31T01:02:33.000Z/2013-08-31T10:00:00.000Z"
        );
    }

    #[test]
    fn parse_rejects_reversed_bounds() {
        let result = "2013-09-01/2013-08-31".parse::<Interval>();
        assert!(matches!(
            result,
            Err(InvalidIntervalError::EndBeforeStart { .. })
        ));
    }

    #[test]
    fn overlap_and_enclosure_are_half_open() {
        let first = interval("2013-08-31/2013-09-01");
        let second = interval("2013-09-01/2013-09-02");
        let both = interval("2013-08-31/2013-09-02");

        assert!(!first.overlaps(&second));
        assert!(both.overlaps(&first) && both.overlaps(&second));
        assert!(both.encloses(&first));
        assert!(!first.encloses(&both));
        assert!(!first.contains(second.start()));
    }

    #[test]
    fn serde_uses_string_form() {
        let value = interval("2013-08-31/2013-09-01");
        let json = serde_json::to_string(&value).expect("Failed to serialize interval");
        assert_eq!(json, r#""2013-08-31T00:00:00.000Z/2013-09-01T00:00:00.000Z""#);

        let back: Interval = serde_json::from_str(&json).expect("Failed to deserialize interval");
        assert_eq!(back, value);
    }

    #[test]
    fn eternity_round_trips_through_text() {
        let eternity = Interval::eternity();
        assert_eq!(interval(&eternity.to_string()), eternity);
    }
}
