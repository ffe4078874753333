//! Timezone-aware loss-window boundaries.
//!
//! Daily and weekly realized-loss checks are anchored in the account's
//! configured timezone; everything downstream compares in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

fn parse_tz(timezone: &str) -> Tz {
    timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!("Unknown timezone '{}', falling back to UTC", timezone);
        Tz::UTC
    })
}

fn parse_reset_time(reset_time: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(reset_time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(reset_time, "%H:%M:%S"))
        .ok()
}

fn local_to_utc(tz: Tz, naive: chrono::NaiveDateTime) -> Option<DateTime<Utc>> {
    // DST gaps can make a local time nonexistent; nudge forward an hour.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

fn local_midnight_utc(tz: Tz, local: DateTime<Tz>) -> DateTime<Utc> {
    let naive = local.date_naive().and_hms_opt(0, 0, 0).unwrap_or(local.naive_local());
    local_to_utc(tz, naive).unwrap_or_else(|| local.with_timezone(&Utc))
}

/// Start of the current daily loss window, in UTC.
///
/// With a reset time, the window opens at that local time; if the reset lies
/// in the local future, yesterday's reset applies.
pub fn today_start(timezone: &str, reset_time: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let tz = parse_tz(timezone);
    let local_now = now.with_timezone(&tz);

    let Some(reset) = reset_time.and_then(parse_reset_time) else {
        return local_midnight_utc(tz, local_now);
    };

    let mut naive = local_now.date_naive().and_time(reset);
    if naive > local_now.naive_local() {
        naive -= Duration::days(1);
    }
    local_to_utc(tz, naive).unwrap_or_else(|| local_midnight_utc(tz, local_now))
}

/// Start of the current weekly loss window, in UTC.
///
/// `reset_day`: 1 = Monday … 7 = Sunday. The window opens at local midnight
/// of the most recent reset day.
pub fn week_start(timezone: &str, reset_day: u8, now: DateTime<Utc>) -> DateTime<Utc> {
    let tz = parse_tz(timezone);
    let local_now = now.with_timezone(&tz);

    let reset_day = i64::from(reset_day.clamp(1, 7));
    let current_weekday = i64::from(local_now.date_naive().weekday().number_from_monday());
    let days_back = (current_weekday - reset_day).rem_euclid(7);

    let start_local = local_now - Duration::days(days_back);
    local_midnight_utc(tz, start_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_midnight_without_reset_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap();
        let start = today_start("UTC", None, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn reset_time_in_future_uses_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        let start = today_start("UTC", Some("10:00"), now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap());

        let later = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let start = today_start("UTC", Some("10:00"), later);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn timezone_shifts_the_window() {
        // 01:00 UTC on the 15th is already the 15th in Tokyo (10:00),
        // so the Tokyo day started at 15:00 UTC on the 14th.
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).unwrap();
        let start = today_start("Asia/Tokyo", None, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 14, 15, 0, 0).unwrap());
    }

    #[test]
    fn week_resets_on_monday_by_default() {
        // 2024-03-15 is a Friday; Monday was the 11th.
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 14, 0, 0).unwrap();
        let start = week_start("UTC", 1, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
        assert_eq!(start.weekday().number_from_monday(), 1);
    }

    #[test]
    fn week_reset_day_sunday() {
        // Friday the 15th with Sunday resets: window opened Sunday the 10th.
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 14, 0, 0).unwrap();
        let start = week_start("UTC", 7, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 14, 0, 0).unwrap();
        let start = today_start("Not/AZone", None, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap());
    }
}
