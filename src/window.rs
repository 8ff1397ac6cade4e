//! Daily index-update window.
//!
//! Once a day the exchange updates its index prices. Trading is suspended and
//! open positions are unwound between `min` and `max` (UTC).

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const MS_PER_HOUR: Decimal = dec!(3_600_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWindow {
    pub min_hours: u32,
    pub min_minutes: u32,
    pub max_hours: u32,
    pub max_minutes: u32,
}

impl Default for IndexWindow {
    fn default() -> Self {
        Self {
            min_hours: 11,
            min_minutes: 30,
            max_hours: 11,
            max_minutes: 40,
        }
    }
}

impl IndexWindow {
    pub fn start_time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.min_hours, self.min_minutes, 0)
    }

    pub fn end_time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.max_hours, self.max_minutes, 0)
    }

    pub fn is_well_formed(&self) -> bool {
        matches!((self.start_time(), self.end_time()), (Some(start), Some(end)) if start < end)
    }

    /// Start and end of the window on the given UTC day.
    pub fn bounds_on(&self, day: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = Utc.from_utc_datetime(&day.and_time(self.start_time()?));
        let end = Utc.from_utc_datetime(&day.and_time(self.end_time()?));
        Some((start, end))
    }

    // open interval, same as the exchange: trading resumes exactly at max
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match self.bounds_on(now.date_naive()) {
            Some((start, end)) => now > start && now < end,
            None => false,
        }
    }

    pub fn next_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (today_start, _) = self.bounds_on(now.date_naive())?;
        if today_start > now {
            Some(today_start)
        } else {
            Some(today_start + Duration::days(1))
        }
    }

    /// Funding horizon: hours from `now` to the next window start.
    pub fn hours_until_start(&self, now: DateTime<Utc>) -> Decimal {
        match self.next_start(now) {
            Some(start) => Decimal::from((start - now).num_milliseconds()) / MS_PER_HOUR,
            None => Decimal::ZERO,
        }
    }
}
