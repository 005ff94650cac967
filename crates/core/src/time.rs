//! Timestamp parsing and formatting.
//!
//! Remote providers disagree on timestamp shapes: RFC 3339 with `Z`, offsets
//! without a colon (`+0000`), naive date-times, or bare dates for all-day items.
//! Everything is normalized to UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{CoreError, CoreResult};

/// Parse a provider timestamp into UTC.
///
/// Naive values (no offset) and bare dates are interpreted as UTC; a bare date
/// maps to midnight.
pub fn parse_timestamp(value: &str) -> CoreResult<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(CoreError::invalid_timestamp(value.to_string()))
}

/// Parse a provider timestamp straight to epoch seconds.
pub fn parse_epoch(value: &str) -> CoreResult<i64> {
    parse_timestamp(value).map(|dt| dt.timestamp())
}

/// Canonical wire format: second precision, `Z` suffix.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format epoch seconds in the canonical wire format.
pub fn format_epoch(ts: i64) -> Option<String> {
    Utc.timestamp_opt(ts, 0).single().map(|dt| format_timestamp(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zulu_and_offset_forms_to_the_same_instant() {
        let a = parse_epoch("2024-05-01T10:00:00Z").unwrap();
        let b = parse_epoch("2024-05-01T12:00:00+02:00").unwrap();
        let c = parse_epoch("2024-05-01T12:00:00.000+0200").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn naive_and_date_only_values_are_utc() {
        assert_eq!(
            parse_epoch("2024-05-01T00:00:00").unwrap(),
            parse_epoch("2024-05-01").unwrap()
        );
        assert_eq!(parse_epoch("1970-01-02").unwrap(), 86_400);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn formats_with_second_precision() {
        assert_eq!(format_epoch(0).as_deref(), Some("1970-01-01T00:00:00Z"));
        let dt = parse_timestamp("2024-05-01T10:00:00.123Z").unwrap();
        assert_eq!(format_timestamp(&dt), "2024-05-01T10:00:00Z");
    }
}
