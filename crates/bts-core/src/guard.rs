//! Per-key validity rules.
//!
//! A [`ValidityRule`] is the configurable predicate the [`SnapshotStore`]
//! applies before accepting a payload. Field paths are JSON pointers
//! (`"/value"`, `"/data/0/price"`); the empty pointer `""` is the payload
//! itself.
//!
//! ```json
//! {"rule": "positive", "field": "/value"}
//! {"rule": "any_positive", "fields": ["/totalMarketCapUsd", "/btcDominance"]}
//! {"rule": "all", "rules": [{"rule": "present", "fields": ["/value"]}, {"rule": "non_zero", "field": "/value"}]}
//! ```
//!
//! [`SnapshotStore`]: crate::store::SnapshotStore

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compiled validity predicate: `true` means the payload may be stored.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Declarative validity predicate for one metric family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidityRule {
    /// Field must be a finite number strictly greater than zero.
    Positive { field: String },
    /// Field must be a finite, non-zero number (sign is free).
    NonZero { field: String },
    /// At least one of the fields must be a positive number (not all zero).
    AnyPositive { fields: Vec<String> },
    /// Every field must be present and non-null.
    Present { fields: Vec<String> },
    /// Field must be a non-empty array of objects.
    NonEmptyArray {
        #[serde(default)]
        field: String,
    },
    /// Every nested rule must hold.
    All { rules: Vec<ValidityRule> },
    /// Accept anything.
    Always,
}

impl ValidityRule {
    /// `positive` on `/value`, the default for scalar metrics.
    pub fn positive_value() -> Self {
        Self::Positive {
            field: "/value".into(),
        }
    }

    pub fn check(&self, payload: &Value) -> bool {
        match self {
            Self::Positive { field } => number_at(payload, field).is_some_and(|n| n > 0.0),
            Self::NonZero { field } => number_at(payload, field).is_some_and(|n| n != 0.0),
            Self::AnyPositive { fields } => {
                fields.iter().any(|f| number_at(payload, f).is_some_and(|n| n > 0.0))
            }
            Self::Present { fields } => {
                fields.iter().all(|f| payload.pointer(f).is_some_and(|v| !v.is_null()))
            }
            Self::NonEmptyArray { field } => payload
                .pointer(field)
                .and_then(Value::as_array)
                .is_some_and(|items| !items.is_empty() && items.iter().all(Value::is_object)),
            Self::All { rules } => rules.iter().all(|r| r.check(payload)),
            Self::Always => true,
        }
    }

    pub fn into_validator(self) -> Validator {
        Arc::new(move |payload| self.check(payload))
    }
}

#[inline]
fn number_at(payload: &Value, pointer: &str) -> Option<f64> {
    payload.pointer(pointer)?.as_f64().filter(|n| n.is_finite())
}
