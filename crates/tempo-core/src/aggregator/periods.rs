//! Period boundaries in a fixed UTC offset. Weeks start on Monday.

use chrono::{DateTime, Datelike, Days, Duration, FixedOffset, Months, NaiveDateTime, Timelike, Utc};
use tempo_storage::Granularity;

/// Start of the period containing `at`
#[must_use]
pub fn period_start(granularity: Granularity, at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = at.with_timezone(&offset).naive_local();
    let midnight = local.date().and_time(chrono::NaiveTime::MIN);

    let start = match granularity {
        Granularity::Hour => midnight + Duration::hours(i64::from(local.hour())),
        Granularity::Day => midnight,
        Granularity::Week => {
            midnight - Days::new(u64::from(local.weekday().num_days_from_monday()))
        }
        Granularity::Month => midnight - Days::new(u64::from(local.day0())),
    };
    to_utc(start, offset)
}

/// Start of the period following the one starting at `start`.
/// `None` only past the end of representable time.
#[must_use]
pub fn next_period_start(
    granularity: Granularity,
    start: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let local = start.with_timezone(&offset).naive_local();
    let next = match granularity {
        Granularity::Hour => local.checked_add_signed(Duration::hours(1))?,
        Granularity::Day => local.checked_add_days(Days::new(1))?,
        Granularity::Week => local.checked_add_days(Days::new(7))?,
        Granularity::Month => local.checked_add_months(Months::new(1))?,
    };
    Some(to_utc(next, offset))
}

/// First period boundary at or after `at`
#[must_use]
pub fn ceil_to_period(
    granularity: Granularity,
    at: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let start = period_start(granularity, at, offset);
    if start == at {
        Some(start)
    } else {
        next_period_start(granularity, start, offset)
    }
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    let utc = local - Duration::seconds(i64::from(offset.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_utc_boundaries() {
        let offset = FixedOffset::east_opt(0).unwrap();
        // Wednesday
        let at = utc(2024, 5, 15, 13, 42);

        assert_eq!(period_start(Granularity::Hour, at, offset), utc(2024, 5, 15, 13, 0));
        assert_eq!(period_start(Granularity::Day, at, offset), utc(2024, 5, 15, 0, 0));
        assert_eq!(period_start(Granularity::Week, at, offset), utc(2024, 5, 13, 0, 0));
        assert_eq!(period_start(Granularity::Month, at, offset), utc(2024, 5, 1, 0, 0));
    }

    #[test]
    fn test_offset_shifts_day_boundary() {
        // UTC+9: 2024-05-15 20:00 UTC is already May 16 locally
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let at = utc(2024, 5, 15, 20, 0);
        assert_eq!(period_start(Granularity::Day, at, tokyo), utc(2024, 5, 15, 15, 0));

        let new_york = FixedOffset::west_opt(4 * 3600).unwrap();
        assert_eq!(
            period_start(Granularity::Day, utc(2024, 5, 15, 2, 0), new_york),
            utc(2024, 5, 14, 4, 0)
        );
    }

    #[test]
    fn test_next_period_handles_month_lengths() {
        let offset = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            next_period_start(Granularity::Month, utc(2024, 2, 1, 0, 0), offset),
            Some(utc(2024, 3, 1, 0, 0))
        );
        assert_eq!(
            next_period_start(Granularity::Month, utc(2024, 12, 1, 0, 0), offset),
            Some(utc(2025, 1, 1, 0, 0))
        );
        assert_eq!(
            next_period_start(Granularity::Week, utc(2024, 5, 13, 0, 0), offset),
            Some(utc(2024, 5, 20, 0, 0))
        );
    }

    #[test]
    fn test_ceil_to_period() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let boundary = utc(2024, 5, 15, 0, 0);
        assert_eq!(ceil_to_period(Granularity::Day, boundary, offset), Some(boundary));
        assert_eq!(
            ceil_to_period(Granularity::Day, utc(2024, 5, 15, 0, 1), offset),
            Some(utc(2024, 5, 16, 0, 0))
        );
    }
}
