//! Metric keys, snapshots and key selectors.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// MetricKey
// ---------------------------------------------------------------------------

/// Opaque name of one metric family, e.g. `global.btcDominance`.
///
/// Keys are disjoint per source: each key is owned by exactly one collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricKey(String);

impl MetricKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key is selected by `selector`.
    pub fn matches(&self, selector: &str) -> bool {
        matches_selector(selector, &self.0)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MetricKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MetricKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MetricKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Match a key against a selector.
///
/// - `"*"` selects every key
/// - `"upbit.*"` selects every key starting with `"upbit."`
/// - anything else must equal the key exactly
pub fn matches_selector(selector: &str, key: &str) -> bool {
    if selector == "*" {
        return true;
    }
    match selector.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => selector == key,
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The latest known-good value of one metric plus its fetch time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub key: MetricKey,
    pub value: Value,
    /// Milliseconds since Unix epoch at which the payload was fetched.
    pub fetched_at: u64,
    /// Whether the payload passed its key's validator. Stored snapshots are
    /// always valid; the flag travels with copies handed to readers.
    pub valid: bool,
}

impl Snapshot {
    /// Age of this snapshot relative to `now_ms`.
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.fetched_at)
    }
}
