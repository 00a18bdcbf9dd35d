use chrono::{Duration, Local, NaiveDateTime, NaiveTime, Timelike};

/// Format of the vendor's `nextPeriodTime` field.
pub const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S";

/// Source of local wall-clock time. Holds are expressed in the thermostat's
/// local time, so everything here is naive local time.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Round up to the next :00/:15/:30/:45 boundary. Timestamps already on a
/// boundary (zero seconds and sub-seconds) are returned unchanged.
pub fn round_up_to_quarter_hour(dt: NaiveDateTime) -> NaiveDateTime {
    if dt.minute() % 15 == 0 && dt.second() == 0 && dt.nanosecond() == 0 {
        return dt;
    }
    // minute is < 60 and hour < 24, so this time always exists
    let floor = dt
        .date()
        .and_hms_opt(dt.hour(), dt.minute() / 15 * 15, 0)
        .unwrap_or(dt);
    floor + Duration::minutes(15)
}

/// Whether `time_str` (`HH:MM:SS`, taken on `now`'s calendar day) lies strictly
/// after `now + minutes`.
pub fn is_at_least_minutes_in_future(time_str: &str, minutes: i64, now: NaiveDateTime) -> Result<bool, chrono::ParseError> {
    let given_time = NaiveTime::parse_from_str(time_str, TIME_OF_DAY_FORMAT)?;
    let given = now.date().and_time(given_time);
    Ok(given > now + Duration::minutes(minutes))
}

/// Round to the nearest integer, ties to even.
pub fn round_whole(value: f64) -> f64 {
    value.round_ties_even()
}

/// Round to the nearest half, ties to even.
pub fn round_half(value: f64) -> f64 {
    (2.0 * value).round_ties_even() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn quarter_hour_boundaries_are_unchanged() {
        for m in [0, 15, 30, 45] {
            assert_eq!(round_up_to_quarter_hour(at(9, m, 0)), at(9, m, 0));
        }
    }

    #[test]
    fn rounds_up_to_next_quarter() {
        assert_eq!(round_up_to_quarter_hour(at(9, 1, 0)), at(9, 15, 0));
        assert_eq!(round_up_to_quarter_hour(at(9, 14, 59)), at(9, 15, 0));
        assert_eq!(round_up_to_quarter_hour(at(9, 15, 1)), at(9, 30, 0));
        assert_eq!(round_up_to_quarter_hour(at(9, 44, 0)), at(9, 45, 0));
    }

    #[test]
    fn sub_second_offsets_round_up() {
        let dt = at(9, 30, 0) + Duration::microseconds(1);
        assert_eq!(round_up_to_quarter_hour(dt), at(9, 45, 0));
    }

    #[test]
    fn rolls_over_hour_and_day() {
        assert_eq!(round_up_to_quarter_hour(at(9, 50, 0)), at(10, 0, 0));
        let next_day = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(round_up_to_quarter_hour(at(23, 52, 0)), next_day);

        let new_year = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap().and_hms_opt(23, 46, 30).unwrap();
        assert_eq!(
            round_up_to_quarter_hour(new_year),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn future_check_is_strict() {
        assert!(is_at_least_minutes_in_future("14:00:00", 15, at(13, 44, 0)).unwrap());
        assert!(!is_at_least_minutes_in_future("14:00:00", 15, at(13, 46, 0)).unwrap());
        assert!(!is_at_least_minutes_in_future("14:00:00", 15, at(13, 45, 0)).unwrap());
    }

    #[test]
    fn future_check_uses_same_calendar_day() {
        // 00:10 is read as today, i.e. already in the past at 23:50
        assert!(!is_at_least_minutes_in_future("00:10:00", 15, at(23, 50, 0)).unwrap());
    }

    #[test]
    fn future_check_rejects_garbage() {
        assert!(is_at_least_minutes_in_future("2pm", 15, at(13, 0, 0)).is_err());
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_whole(68.0), 68.0);
        assert_eq!(round_whole(69.8), 70.0);
        assert_eq!(round_whole(68.5), 68.0);
        assert_eq!(round_half(21.111), 21.0);
        assert_eq!(round_half(21.3), 21.5);
        assert_eq!(round_half(20.25), 20.0);
    }
}
