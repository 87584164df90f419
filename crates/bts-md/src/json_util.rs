//! Shared JSON parsing helpers used by all source parsers.

use serde_json::Value;

/// Parse a JSON value (string or number) as `f64`.
///
/// Upstreams encode numbers either as JSON strings (`"30000.5"`) or native
/// numbers (`30000.5`).
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

/// Value at a JSON pointer as `f64` (string or number).
#[inline]
pub fn f64_at(v: &Value, pointer: &str) -> Option<f64> {
    parse_str_f64(v.pointer(pointer))
}

/// Percentage change from `base` to `current`; zero when `base` is not positive.
#[inline]
pub fn change_rate(current: f64, base: f64) -> f64 {
    if base > 0.0 { (current - base) / base * 100.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_as_strings_or_numbers() {
        let v = json!({"a": "30000.5", "b": 12.25, "c": "x", "d": "42"});
        assert_eq!(parse_f64_field(&v, "a"), Some(30000.5));
        assert_eq!(parse_f64_field(&v, "b"), Some(12.25));
        assert_eq!(parse_f64_field(&v, "c"), None);
        assert_eq!(parse_f64_field(&v, "missing"), None);
        assert_eq!(parse_str_u64(v.get("d")), Some(42));
        assert_eq!(f64_at(&json!({"usd": {"krw": 1380.5}}), "/usd/krw"), Some(1380.5));
    }

    #[test]
    fn change_rate_guards_zero_base() {
        assert!((change_rate(110.0, 100.0) - 10.0).abs() < 1e-9);
        assert_eq!(change_rate(110.0, 0.0), 0.0);
    }
}
