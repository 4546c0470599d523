//! Day-first timestamp parsing for spreadsheet cells

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

/// Formats with a time part, day-first before ISO
const DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S%.f",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M:%S%.f",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d"];

/// Largest serial that still lands before the year 10000
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

/// Parse a textual timestamp, reading ambiguous dates day-first.
///
/// Returns `None` for anything unparsable; callers store that as NULL.
pub fn parse_day_first(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    None
}

/// Convert an Excel serial day number (1900 date system) to a timestamp
pub fn from_excel_serial(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= 0.0 || serial > MAX_EXCEL_SERIAL {
        return None;
    }

    // Day zero is 1899-12-30 so that the 1900 leap-year bug cancels out
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_day_first() {
        assert_eq!(parse_day_first("02/01/2024"), Some(ts(2024, 1, 2, 0, 0, 0)));
        assert_eq!(
            parse_day_first("13/05/2024 14:30"),
            Some(ts(2024, 5, 13, 14, 30, 0))
        );
        assert_eq!(
            parse_day_first("01.02.2023 08:00:05"),
            Some(ts(2023, 2, 1, 8, 0, 5))
        );
    }

    #[test]
    fn test_iso() {
        assert_eq!(
            parse_day_first("2024-01-02 10:11:12"),
            Some(ts(2024, 1, 2, 10, 11, 12))
        );
        assert_eq!(
            parse_day_first("2024-01-02T10:11:12.500"),
            ts(2024, 1, 2, 10, 11, 12).checked_add_signed(TimeDelta::milliseconds(500))
        );
        assert_eq!(parse_day_first("2024-01-02"), Some(ts(2024, 1, 2, 0, 0, 0)));
    }

    #[test]
    fn test_unparsable_is_none() {
        assert_eq!(parse_day_first(""), None);
        assert_eq!(parse_day_first("   "), None);
        assert_eq!(parse_day_first("not a date"), None);
        assert_eq!(parse_day_first("32/01/2024"), None);
    }

    #[test]
    fn test_excel_serial() {
        assert_eq!(from_excel_serial(45293.0), Some(ts(2024, 1, 2, 0, 0, 0)));
        assert_eq!(from_excel_serial(45293.5), Some(ts(2024, 1, 2, 12, 0, 0)));
        assert_eq!(from_excel_serial(-1.0), None);
        assert_eq!(from_excel_serial(f64::NAN), None);
    }
}
