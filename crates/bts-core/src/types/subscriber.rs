//! Subscriber classes, broadcast policies and connection records.

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Named category of consumer (`dashboard`, `screening`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberClass(String);

impl SubscriberClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SubscriberClass {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriberClass {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubscriberClass {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether and how often a class receives pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastPolicy {
    pub enabled: bool,
    pub interval: Duration,
}

impl BroadcastPolicy {
    /// Policy of any class nobody configured.
    pub const DISABLED: Self = Self {
        enabled: false,
        interval: Duration::ZERO,
    };

    pub fn every(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
        }
    }

    /// A class is scheduled only when enabled with a non-zero interval.
    #[inline]
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.interval.is_zero()
    }
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self::DISABLED
    }
}

/// Identifier of one live subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live subscriber connection as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub class: SubscriberClass,
    /// Milliseconds since Unix epoch.
    pub connected_at: u64,
}
