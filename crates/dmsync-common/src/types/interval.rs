use chrono::{Datelike, Days, DurationRound, Months, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use super::{format_timestamp, Timestamp};
use crate::error::{CommonError, Result};

/// Calendar granularity used to align partition boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Year,
    Quarter,
    Month,
    /// ISO weeks, starting Monday 00:00
    Week,
    Day,
    Hour,
    FiveMinute,
    Minute,
}

impl Interval {
    /// Round `ts` down to the nearest boundary of this interval
    pub fn truncate(self, ts: Timestamp) -> Result<Timestamp> {
        let date = ts.date_naive();
        let midnight = |d: chrono::NaiveDate| d.and_time(NaiveTime::MIN).and_utc();

        match self {
            Interval::Year => Ok(midnight(date - Days::new(u64::from(date.ordinal0())))),
            Interval::Month => Ok(midnight(date - Days::new(u64::from(date.day0())))),
            Interval::Quarter => {
                let month_start = date - Days::new(u64::from(date.day0()));
                month_start
                    .checked_sub_months(Months::new(month_start.month0() % 3))
                    .map(midnight)
                    .ok_or_else(|| out_of_range(ts))
            },
            Interval::Week => Ok(midnight(
                date - Days::new(u64::from(date.weekday().num_days_from_monday())),
            )),
            Interval::Day => Ok(midnight(date)),
            Interval::Hour => trunc(ts, TimeDelta::hours(1)),
            Interval::FiveMinute => trunc(ts, TimeDelta::minutes(5)),
            Interval::Minute => trunc(ts, TimeDelta::minutes(1)),
        }
    }

    /// Previous boundary before an already aligned `ts`
    pub fn step_back(self, ts: Timestamp) -> Result<Timestamp> {
        let stepped = match self {
            Interval::Year => ts.checked_sub_months(Months::new(12)),
            Interval::Quarter => ts.checked_sub_months(Months::new(3)),
            Interval::Month => ts.checked_sub_months(Months::new(1)),
            Interval::Week => ts.checked_sub_signed(TimeDelta::weeks(1)),
            Interval::Day => ts.checked_sub_signed(TimeDelta::days(1)),
            Interval::Hour => ts.checked_sub_signed(TimeDelta::hours(1)),
            Interval::FiveMinute => ts.checked_sub_signed(TimeDelta::minutes(5)),
            Interval::Minute => ts.checked_sub_signed(TimeDelta::minutes(1)),
        };
        stepped.ok_or_else(|| out_of_range(ts))
    }

    /// Start of the bucket that ends at `upper` (exclusive)
    pub fn bucket_start(self, upper: Timestamp) -> Result<Timestamp> {
        let aligned = self.truncate(upper)?;
        if aligned < upper {
            Ok(aligned)
        } else {
            self.step_back(aligned)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Year => "year",
            Interval::Quarter => "quarter",
            Interval::Month => "month",
            Interval::Week => "week",
            Interval::Day => "day",
            Interval::Hour => "hour",
            Interval::FiveMinute => "five_minute",
            Interval::Minute => "minute",
        }
    }
}

fn trunc(ts: Timestamp, unit: TimeDelta) -> Result<Timestamp> {
    ts.duration_trunc(unit).map_err(|_| out_of_range(ts))
}

fn out_of_range(ts: Timestamp) -> CommonError {
    CommonError::OutOfRange(format_timestamp(ts))
}

impl std::str::FromStr for Interval {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "year" | "yearly" => Ok(Interval::Year),
            "quarter" | "quarterly" => Ok(Interval::Quarter),
            "month" | "monthly" => Ok(Interval::Month),
            "week" | "weekly" => Ok(Interval::Week),
            "day" | "daily" => Ok(Interval::Day),
            "hour" | "hourly" => Ok(Interval::Hour),
            "five_minute" | "fiveminute" | "5min" => Ok(Interval::FiveMinute),
            "minute" => Ok(Interval::Minute),
            _ => Err(CommonError::InvalidInterval(s.to_string())),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
