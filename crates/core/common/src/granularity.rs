//! Time bucketing for segment intervals and rolled-up row timestamps.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Interval;

const SECOND_MILLIS: i64 = 1_000;
const MINUTE_MILLIS: i64 = 60 * SECOND_MILLIS;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;
/// 1970-01-05 was the first Monday after the epoch.
const FIRST_MONDAY_MILLIS: i64 = 4 * DAY_MILLIS;

/// A bucketing of the time line.
///
/// Fixed-width granularities are aligned to the epoch in UTC, weeks start on Monday and calendar
/// granularities (month, quarter, year) follow the UTC calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Granularity {
    /// Millisecond precision; timestamps are kept as-is.
    #[default]
    None,
    Second,
    Minute,
    FiveMinute,
    FifteenMinute,
    ThirtyMinute,
    Hour,
    SixHour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    /// A single bucket spanning all time.
    All,
}

impl Granularity {
    /// Returns the start of the bucket containing `instant`.
    pub fn truncate(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let millis = instant.timestamp_millis();
        let floor = |width: i64, origin: i64| {
            let truncated = millis - (millis - origin).rem_euclid(width);
            DateTime::from_timestamp_millis(truncated).unwrap_or(instant)
        };

        match self {
            Granularity::None => instant,
            Granularity::Second => floor(SECOND_MILLIS, 0),
            Granularity::Minute => floor(MINUTE_MILLIS, 0),
            Granularity::FiveMinute => floor(5 * MINUTE_MILLIS, 0),
            Granularity::FifteenMinute => floor(15 * MINUTE_MILLIS, 0),
            Granularity::ThirtyMinute => floor(30 * MINUTE_MILLIS, 0),
            Granularity::Hour => floor(HOUR_MILLIS, 0),
            Granularity::SixHour => floor(6 * HOUR_MILLIS, 0),
            Granularity::Day => floor(DAY_MILLIS, 0),
            Granularity::Week => floor(7 * DAY_MILLIS, FIRST_MONDAY_MILLIS),
            Granularity::Month => month_start(instant.year(), instant.month()).unwrap_or(instant),
            Granularity::Quarter => {
                let month = (instant.month0() / 3) * 3 + 1;
                month_start(instant.year(), month).unwrap_or(instant)
            }
            Granularity::Year => month_start(instant.year(), 1).unwrap_or(instant),
            Granularity::All => Interval::eternity().start(),
        }
    }

    /// Returns the bucket containing `instant`.
    pub fn bucket(&self, instant: DateTime<Utc>) -> Interval {
        if *self == Granularity::All {
            return Interval::eternity();
        }

        let start = self.truncate(instant);
        let end = self.next_bucket_start(start).unwrap_or(start);
        // `next_bucket_start` never goes backwards, so the interval is always valid
        Interval::new(start, end).unwrap_or_else(|_| Interval::eternity())
    }

    fn next_bucket_start(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let millis = |n: i64| start.checked_add_signed(TimeDelta::milliseconds(n));
        match self {
            Granularity::None => millis(1),
            Granularity::Second => millis(SECOND_MILLIS),
            Granularity::Minute => millis(MINUTE_MILLIS),
            Granularity::FiveMinute => millis(5 * MINUTE_MILLIS),
            Granularity::FifteenMinute => millis(15 * MINUTE_MILLIS),
            Granularity::ThirtyMinute => millis(30 * MINUTE_MILLIS),
            Granularity::Hour => millis(HOUR_MILLIS),
            Granularity::SixHour => millis(6 * HOUR_MILLIS),
            Granularity::Day => millis(DAY_MILLIS),
            Granularity::Week => millis(7 * DAY_MILLIS),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Quarter => start.checked_add_months(Months::new(3)),
            Granularity::Year => start.checked_add_months(Months::new(12)),
            Granularity::All => Some(Interval::eternity().end()),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Granularity::None => "NONE",
            Granularity::Second => "SECOND",
            Granularity::Minute => "MINUTE",
            Granularity::FiveMinute => "FIVE_MINUTE",
            Granularity::FifteenMinute => "FIFTEEN_MINUTE",
            Granularity::ThirtyMinute => "THIRTY_MINUTE",
            Granularity::Hour => "HOUR",
            Granularity::SixHour => "SIX_HOUR",
            Granularity::Day => "DAY",
            Granularity::Week => "WEEK",
            Granularity::Month => "MONTH",
            Granularity::Quarter => "QUARTER",
            Granularity::Year => "YEAR",
            Granularity::All => "ALL",
        }
    }
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1).map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = UnknownGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let granularity = match s.to_ascii_uppercase().as_str() {
            "NONE" => Granularity::None,
            "SECOND" => Granularity::Second,
            "MINUTE" => Granularity::Minute,
            "FIVE_MINUTE" => Granularity::FiveMinute,
            "FIFTEEN_MINUTE" => Granularity::FifteenMinute,
            "THIRTY_MINUTE" => Granularity::ThirtyMinute,
            "HOUR" => Granularity::Hour,
            "SIX_HOUR" => Granularity::SixHour,
            "DAY" => Granularity::Day,
            "WEEK" => Granularity::Week,
            "MONTH" => Granularity::Month,
            "QUARTER" => Granularity::Quarter,
            "YEAR" => Granularity::Year,
            "ALL" => Granularity::All,
            _ => return Err(UnknownGranularityError(s.to_string())),
        };
        Ok(granularity)
    }
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown granularity '{0}'")]
pub struct UnknownGranularityError(String);
