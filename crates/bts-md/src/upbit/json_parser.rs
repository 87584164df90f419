//! Upbit CRIX candle parser.
//!
//! The candle endpoint returns an array with one daily candle:
//!
//! ```json
//! [{"code": "IDX.UPBIT.COMPOSITE", "tradePrice": 12000.5, "openingPrice": 11880.1, ...}]
//! ```

use serde_json::{Value, json};

use crate::json_util::{change_rate, parse_f64_field};

/// Index level with its change since the day's open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexQuote {
    pub value: f64,
    pub change: f64,
    pub change_rate: f64,
}

impl IndexQuote {
    pub fn to_payload(self) -> Value {
        json!({"value": self.value, "change": self.change, "changeRate": self.change_rate})
    }
}

/// Parse the first candle of a CRIX response. Returns `None` when the
/// response is empty or lacks a trade price.
pub fn parse_candle(body: &Value) -> Option<IndexQuote> {
    let candle = body.as_array()?.first()?;
    let value = parse_f64_field(candle, "tradePrice")?;
    let open = parse_f64_field(candle, "openingPrice").unwrap_or(0.0);
    let change = if open > 0.0 { value - open } else { 0.0 };
    Some(IndexQuote {
        value,
        change,
        change_rate: change_rate(value, open),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_candle() {
        let body = json!([
            {"code": "IDX.UPBIT.TOP10", "tradePrice": 110.0, "openingPrice": "100.0"}
        ]);
        let q = parse_candle(&body).unwrap();
        assert_eq!(q.value, 110.0);
        assert_eq!(q.change, 10.0);
        assert!((q.change_rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn missing_open_means_no_change() {
        let q = parse_candle(&json!([{"tradePrice": 110.0}])).unwrap();
        assert_eq!(q.change, 0.0);
        assert_eq!(q.change_rate, 0.0);
    }

    #[test]
    fn rejects_empty_or_malformed() {
        assert!(parse_candle(&json!([])).is_none());
        assert!(parse_candle(&json!({"tradePrice": 1.0})).is_none());
        assert!(parse_candle(&json!([{"openingPrice": 1.0}])).is_none());
    }
}
