//! Push messages delivered to subscribers, and the client hello.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MetricKey, Snapshot, SubscriberClass};

/// `type` tag of a scheduled or on-demand snapshot push.
pub const PUSH_KIND_SNAPSHOT: &str = "snapshot";

/// One push, shared by every connection of a class.
pub type PushFrame = Arc<PushMessage>;

/// A push delivered to one subscriber class.
///
/// ```json
/// {"type":"snapshot","classTag":"dashboard","timestamp":1700000000000,
///  "metrics":{"global.btcDominance":{"value":{"value":57.08},"fetchedAt":1700000000000,"ageMs":0}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub class_tag: SubscriberClass,
    /// Milliseconds since Unix epoch at which the push was built.
    pub timestamp: u64,
    pub metrics: BTreeMap<MetricKey, MetricEntry>,
}

/// One metric inside a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    pub value: Value,
    pub fetched_at: u64,
    pub age_ms: u64,
}

impl PushMessage {
    /// Build a snapshot push for `class` from store contents.
    pub fn from_snapshots<I>(class: SubscriberClass, now_ms: u64, snapshots: I) -> Self
    where
        I: IntoIterator<Item = Snapshot>,
    {
        let metrics = snapshots
            .into_iter()
            .map(|s| {
                let age_ms = s.age_ms(now_ms);
                let entry = MetricEntry {
                    value: s.value,
                    fetched_at: s.fetched_at,
                    age_ms,
                };
                (s.key, entry)
            })
            .collect();
        Self {
            kind: PUSH_KIND_SNAPSHOT.to_string(),
            class_tag: class,
            timestamp: now_ms,
            metrics,
        }
    }
}

/// JSON hello sent by a subscriber to declare (or change) its class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { class: SubscriberClass },
    /// Legacy page hello: `{"type":"client_info","page":"dashboard"}`.
    ClientInfo { page: SubscriberClass },
}

impl ClientMessage {
    pub fn class(&self) -> &SubscriberClass {
        match self {
            Self::Subscribe { class } => class,
            Self::ClientInfo { page } => page,
        }
    }
}
