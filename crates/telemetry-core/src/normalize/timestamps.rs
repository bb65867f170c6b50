//! Timestamp normalization to ISO-8601 UTC with millisecond precision.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

const OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Naive layouts tried after RFC 3339 and RFC 2822; all are read as UTC.
const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%a %b %e %H:%M:%S %Y",
    "%b %e %H:%M:%S %Y",
    "%Y/%m/%d %H:%M:%S",
];

/// Rewrite every value stored under one of `keys`, at any depth.
/// Unparseable values are left as they are.
pub fn format_timestamps(data: &mut Value, keys: &[String]) {
    match data {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if keys.iter().any(|k| k == key) {
                    if let Some(iso) = to_iso(value) {
                        *value = Value::String(iso);
                    }
                } else {
                    format_timestamps(value, keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                format_timestamps(item, keys);
            }
        }
        _ => {}
    }
}

/// Convert a timestamp-like value. Integers of up to ten digits (as numbers
/// or strings) are epoch seconds.
pub fn to_iso(value: &Value) -> Option<String> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(epoch_seconds),
        Value::String(s) => parse_str(s.trim()),
        _ => None,
    }?;
    Some(parsed.format(OUTPUT_FORMAT).to_string())
}

fn epoch_seconds(secs: i64) -> Option<DateTime<Utc>> {
    if secs.unsigned_abs() > 9_999_999_999 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if s.len() <= 10 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(epoch_seconds);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
