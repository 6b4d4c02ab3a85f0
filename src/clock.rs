//! Eastern-time helpers. Settlement and day-keying use a fixed UTC-5 offset
//! (no DST), matching the exchange's calendar for these markets.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

const ET_OFFSET_SECS: i32 = -5 * 3600;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_et() -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(ET_OFFSET_SECS).expect("valid fixed offset");
    Utc::now().with_timezone(&offset)
}

/// Current hour in ET, 0-23.
pub fn et_hour() -> u32 {
    use chrono::Timelike;
    now_et().hour()
}

/// Today's calendar date in ET as YYYY-MM-DD.
pub fn today_et() -> String {
    now_et().format("%Y-%m-%d").to_string()
}

/// Tomorrow's calendar date in ET as YYYY-MM-DD.
pub fn tomorrow_et() -> String {
    (now_et() + Duration::days(1)).format("%Y-%m-%d").to_string()
}

/// Event-ticker date segment, e.g. "26FEB18" for 2026-02-18.
pub fn kalshi_date(date: NaiveDate) -> String {
    date.format("%y%b%d").to_string().to_uppercase()
}

pub fn kalshi_date_today() -> String {
    kalshi_date(now_et().date_naive())
}

pub fn kalshi_date_tomorrow() -> String {
    kalshi_date(now_et().date_naive() + Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kalshi_date_format() {
        let d = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        assert_eq!(kalshi_date(d), "26FEB18");
        let d = NaiveDate::from_ymd_opt(2026, 12, 3).unwrap();
        assert_eq!(kalshi_date(d), "26DEC03");
    }

    #[test]
    fn test_today_et_format() {
        let s = today_et();
        assert_eq!(s.len(), 10);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[7..8], "-");
    }

    #[test]
    fn test_et_hour_in_range() {
        assert!(et_hour() < 24);
    }
}
