//! Currency table parser.
//!
//! ```json
//! {"date": "2026-01-01", "usd": {"krw": 1400.12, "jpy": 150.1, ...}}
//! ```

use serde_json::Value;

use crate::json_util::f64_at;

/// KRW per USD; `None` when absent or not a number.
pub fn parse_usd_krw(body: &Value) -> Option<f64> {
    f64_at(body, "/usd/krw")
}
