//! Service-day resolution.
//!
//! A service day is a civil date in the agency's zone; every stop time on it
//! is seconds since that date's local midnight and may pass 86 400. All
//! schedule arithmetic anchors on the midnight instant computed here, so a
//! 25:30:00 stop time lands at 01:30 civil time of the following day.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// A resolved service day: the civil date plus its local-midnight instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDay {
    pub date: NaiveDate,
    pub tz: Tz,
    midnight_utc: DateTime<Utc>,
}

impl ServiceDay {
    /// The service day for a given civil date.
    pub fn from_date(tz: Tz, date: NaiveDate) -> Self {
        Self {
            date,
            tz,
            midnight_utc: local_midnight(tz, date),
        }
    }

    /// The service day whose civil date contains `instant` in `tz`.
    pub fn containing(tz: Tz, instant: DateTime<Utc>) -> Self {
        let date = instant.with_timezone(&tz).date_naive();
        Self::from_date(tz, date)
    }

    /// Resolve from an epoch-milliseconds instant (e.g. a `serviceDate`
    /// request parameter). `None` for out-of-range values.
    pub fn from_epoch_ms(tz: Tz, ms: i64) -> Option<Self> {
        let instant = DateTime::from_timestamp_millis(ms)?;
        Some(Self::containing(tz, instant))
    }

    pub fn prev(&self) -> Self {
        Self::from_date(self.tz, self.date.pred_opt().unwrap_or(self.date))
    }

    /// Local midnight as epoch milliseconds; this is also the wire
    /// `serviceDate` value.
    pub fn epoch_ms(&self) -> i64 {
        self.midnight_utc.timestamp_millis()
    }

    /// Absolute epoch milliseconds of a schedule time on this service day.
    /// Values past 86 400 s roll into the next civil day.
    pub fn time_at_secs(&self, secs_since_midnight: i32) -> i64 {
        self.epoch_ms() + i64::from(secs_since_midnight) * 1000
    }

    /// Seconds between this day's local midnight and `instant_ms`; negative
    /// before midnight, above 86 400 after the day ends.
    pub fn secs_since_midnight(&self, instant_ms: i64) -> i64 {
        (instant_ms - self.epoch_ms()) / 1000
    }
}

/// The instant of local midnight for a civil date.
///
/// When midnight falls into a DST gap (some zones spring forward at 00:00)
/// the first valid instant of the day is used instead.
fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.with_timezone(&Utc);
    }
    for offset_minutes in [30i64, 60, 120] {
        let shifted = naive + chrono::Duration::minutes(offset_minutes);
        if let Some(dt) = tz.from_local_datetime(&shifted).earliest() {
            return dt.with_timezone(&Utc);
        }
    }
    // Unreachable for real zones; anchor on UTC rather than panic
    Utc.from_utc_datetime(&naive)
}
