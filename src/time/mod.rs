//! Time utilities for the scheduling core
//!
//! Pure helpers for 24-hour `HH:MM` wall-clock values, calendar dates and
//! interval arithmetic. Absolute instants are `DateTime<Utc>`; wall-clock
//! values are interpreted in a fixed UTC offset supplied by the caller.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// A 24-hour wall-clock time with minute precision, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallClock(u16);

impl WallClock {
    pub const MIDNIGHT: WallClock = WallClock(0);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    /// Truncates seconds.
    pub fn from_naive(time: NaiveTime) -> Self {
        Self((time.hour() * 60 + time.minute()) as u16)
    }

    pub fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour() as u32, self.minute() as u32, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for WallClock {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TimeError::InvalidFormat(format!("'{}' is not a valid HH:MM time", s));
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(invalid());
        }
        let digit = |b: u8| if b.is_ascii_digit() { Some((b - b'0') as u16) } else { None };
        let parts = [bytes[0], bytes[1], bytes[3], bytes[4]].map(digit);
        match parts {
            [Some(h1), Some(h2), Some(m1), Some(m2)] => {
                WallClock::from_hm(h1 * 10 + h2, m1 * 10 + m2).ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for WallClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WallClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub fn validate_time_format(s: &str) -> bool {
    s.parse::<WallClock>().is_ok()
}

pub fn is_end_after_start(start: WallClock, end: WallClock) -> bool {
    start.minutes() < end.minutes()
}

pub fn time_to_minutes(s: &str) -> Result<u16, TimeError> {
    s.parse::<WallClock>().map(WallClock::minutes)
}

pub fn minutes_to_time(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Slot start times from `start` (inclusive) in `step`-minute increments.
///
/// A slot is only produced when it fits entirely before `end`, so a trailing
/// partial slot is dropped. The range is `Copy`; iterating it again restarts
/// the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    start: u16,
    end: u16,
    step: u16,
}

pub fn generate_slots(start: WallClock, end: WallClock, step_minutes: u16) -> SlotRange {
    SlotRange {
        start: start.minutes(),
        end: end.minutes(),
        step: step_minutes,
    }
}

impl SlotRange {
    pub fn iter(&self) -> SlotIter {
        SlotIter { next: self.start, range: *self }
    }
}

impl IntoIterator for SlotRange {
    type Item = WallClock;
    type IntoIter = SlotIter;

    fn into_iter(self) -> SlotIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct SlotIter {
    next: u16,
    range: SlotRange,
}

impl Iterator for SlotIter {
    type Item = WallClock;

    fn next(&mut self) -> Option<WallClock> {
        if self.range.step == 0 {
            return None;
        }
        let slot_end = self.next.checked_add(self.range.step)?;
        if slot_end > self.range.end {
            return None;
        }
        let slot = WallClock::from_minutes(self.next)?;
        self.next = slot_end;
        Some(slot)
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| TimeError::InvalidFormat(format!("'{}' is not a valid YYYY-MM-DD date", s)))
}

/// The absolute instant of `time` on `date` in the given offset.
pub fn at_wall_clock(date: NaiveDate, time: WallClock, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(time.to_naive());
    Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
}

pub fn combine_date_and_time(
    date: &str,
    time: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, TimeError> {
    let date = parse_date(date)?;
    let time: WallClock = time.parse()?;
    Ok(at_wall_clock(date, time, offset))
}

/// Day of week with Sunday as 0 and Saturday as 6.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalParts {
    pub date: NaiveDate,
    pub day_of_week: u8,
    pub time: WallClock,
}

pub fn local_parts(instant: DateTime<Utc>, offset: FixedOffset) -> LocalParts {
    let local = instant.with_timezone(&offset);
    let date = local.date_naive();
    LocalParts {
        date,
        day_of_week: day_of_week(date),
        time: WallClock::from_naive(local.time()),
    }
}

/// `[midnight, next midnight)` of `date` as absolute instants.
pub fn day_bounds(date: NaiveDate, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = at_wall_clock(date, WallClock::MIDNIGHT, offset);
    (start, start + Duration::days(1))
}

/// Half-open overlap: `[s1, e1)` and `[s2, e2)` intersect. Touching endpoints do not.
pub fn periods_overlap<T: PartialOrd>(s1: T, e1: T, s2: T, e2: T) -> bool {
    s1 < e2 && s2 < e1
}

pub fn offset_from_minutes(minutes: i32) -> Result<FixedOffset, TimeError> {
    FixedOffset::east_opt(minutes * 60)
        .ok_or_else(|| TimeError::InvalidFormat(format!("{} minutes is not a valid UTC offset", minutes)))
}
