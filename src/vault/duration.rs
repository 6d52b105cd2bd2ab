//! Duration parsing for Vault TTL-style fields
//!
//! Vault accepts durations either as integer seconds or as Go duration
//! strings, and echoes them back as integer seconds. Both forms normalize to
//! whole seconds here.

use std::time::Duration;

use serde_json::Value;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Largest total that still fits whole seconds in a `u64`
const MAX_NANOS: f64 = u64::MAX as f64 * NANOS_PER_SECOND;

/// Parse `"24h"`, `"1h30m"`, `"1.5h"`, `"500ms"`, `"7d"` or `"86400"`
///
/// Returns `None` for empty, negative or malformed input.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<u64>().ok().map(Duration::from_secs);
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = unit_in_nanos(&rest[..unit_len])?;
        rest = &rest[unit_len..];

        total_nanos += number * unit_nanos;
    }

    if !total_nanos.is_finite() || total_nanos < 0.0 || total_nanos > MAX_NANOS {
        return None;
    }
    let secs = (total_nanos / NANOS_PER_SECOND).trunc();
    let nanos = (total_nanos - secs * NANOS_PER_SECOND).round();
    Some(Duration::new(secs as u64, nanos.min(999_999_999.0) as u32))
}

fn unit_in_nanos(unit: &str) -> Option<f64> {
    let nanos = match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" => NANOS_PER_SECOND,
        "m" => 60.0 * NANOS_PER_SECOND,
        "h" => 3_600.0 * NANOS_PER_SECOND,
        "d" => 86_400.0 * NANOS_PER_SECOND,
        _ => return None,
    };
    Some(nanos)
}

/// Canonical whole-second form of a duration-valued JSON field
pub fn canonical_seconds(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => parse_duration(s).map(|d| d.as_secs()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1_800)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("7d"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5_400)));
        assert_eq!(parse_duration("24h0m0s"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5_400)));
    }

    #[test]
    fn test_parse_bare_seconds() {
        assert_eq!(parse_duration("86400"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("12x"), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration("1h m"), None);
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert_eq!(parse_duration("99999999999999999999h"), None);
        assert_eq!(canonical_seconds(&json!("99999999999999999999h")), None);
        assert_eq!(
            parse_duration("1000000h"),
            Some(Duration::from_secs(3_600_000_000))
        );
    }

    #[test]
    fn test_canonical_seconds_unifies_representations() {
        assert_eq!(canonical_seconds(&json!("24h")), Some(86_400));
        assert_eq!(canonical_seconds(&json!(86_400)), Some(86_400));
        assert_eq!(canonical_seconds(&json!(86_400.0)), Some(86_400));
        assert_eq!(canonical_seconds(&json!("86400")), Some(86_400));
        assert_eq!(canonical_seconds(&json!(true)), None);
    }
}
