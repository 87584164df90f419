//! Single-source-of-truth snapshot store.
//!
//! Holds exactly one current [`Snapshot`] per [`MetricKey`]. Every key is
//! registered by the source that owns it together with its [`Validator`];
//! writes are then guarded:
//!
//! - a valid payload replaces the current snapshot atomically
//! - an invalid payload never replaces a prior valid snapshot (the guard
//!   fires and the store keeps serving the old value and its age)
//! - an invalid first payload is declined, so no partial data is exposed
//!
//! All critical sections are in-memory map operations; validation runs
//! outside the write lock.

use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::BtsError;
use crate::guard::Validator;
use crate::time_util;
use crate::types::{MetricKey, Snapshot};

struct Entry {
    owner: String,
    validator: Validator,
    current: Option<Snapshot>,
    rejected: u64,
    last_rejected_at: Option<u64>,
}

/// Guard counters for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuardStats {
    /// Number of payloads rejected by the key's validator.
    pub rejected: u64,
    /// Milliseconds since Unix epoch of the latest rejection.
    pub last_rejected_at: Option<u64>,
}

enum PutOutcome {
    Written,
    Unregistered,
    GuardFired { kept_age_ms: u64 },
    Declined,
}

/// Latest-value table with per-key staleness guard.
#[derive(Default)]
pub struct SnapshotStore {
    entries: RwLock<AHashMap<MetricKey, Entry>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `owner` as the only writer of `key`.
    ///
    /// Re-registering by the same owner replaces the validator and keeps the
    /// current snapshot. A key owned by another source is an error.
    pub fn register(
        &self,
        key: MetricKey,
        owner: &str,
        validator: Validator,
    ) -> Result<(), BtsError> {
        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(entry) if entry.owner != owner => Err(BtsError::Store(format!(
                "key '{key}' is already owned by '{}', cannot register for '{owner}'",
                entry.owner
            ))),
            Some(entry) => {
                entry.validator = validator;
                Ok(())
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        owner: owner.to_string(),
                        validator,
                        current: None,
                        rejected: 0,
                        last_rejected_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Validate and store `payload` under `key`, stamped with the current time.
    ///
    /// Returns `true` only when the payload was written.
    pub fn put(&self, key: &MetricKey, payload: serde_json::Value) -> bool {
        self.put_at(key, payload, time_util::now_ms())
    }

    /// Like [`put`](Self::put) with an explicit fetch timestamp (ms since epoch).
    pub fn put_at(&self, key: &MetricKey, payload: serde_json::Value, fetched_at: u64) -> bool {
        let validator = match self.entries.read().get(key) {
            Some(entry) => entry.validator.clone(),
            None => {
                warn!("[store] put for unregistered key '{key}' ignored");
                return false;
            }
        };
        let valid = validator(&payload);

        let outcome = {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                None => PutOutcome::Unregistered,
                Some(entry) if valid => {
                    entry.current = Some(Snapshot {
                        key: key.clone(),
                        value: payload,
                        fetched_at,
                        valid: true,
                    });
                    PutOutcome::Written
                }
                Some(entry) => {
                    entry.rejected += 1;
                    entry.last_rejected_at = Some(fetched_at);
                    match &entry.current {
                        Some(prev) => PutOutcome::GuardFired {
                            kept_age_ms: prev.age_ms(fetched_at),
                        },
                        None => PutOutcome::Declined,
                    }
                }
            }
        };

        match outcome {
            PutOutcome::Written => {
                debug!("[store] '{key}' updated");
                true
            }
            PutOutcome::Unregistered => {
                warn!("[store] put for unregistered key '{key}' ignored");
                false
            }
            PutOutcome::GuardFired { kept_age_ms } => {
                warn!("[store] guard fired for '{key}', keeping value aged {kept_age_ms} ms");
                false
            }
            PutOutcome::Declined => {
                warn!("[store] invalid first payload for '{key}' declined");
                false
            }
        }
    }

    /// Latest valid snapshot for `key`, if one was ever written.
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        self.entries.read().get(key).and_then(|e| e.current.clone())
    }

    /// Batched read under a single lock. Keys without a snapshot are absent
    /// from the result.
    pub fn get_all<K: AsRef<str>>(&self, keys: &[K]) -> BTreeMap<MetricKey, Snapshot> {
        let entries = self.entries.read();
        keys.iter()
            .filter_map(|k| entries.get(k.as_ref()).and_then(|e| e.current.clone()))
            .map(|s| (s.key.clone(), s))
            .collect()
    }

    /// Every snapshot whose key matches at least one selector, read under a
    /// single lock.
    pub fn select<S: AsRef<str>>(&self, selectors: &[S]) -> BTreeMap<MetricKey, Snapshot> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(key, _)| selectors.iter().any(|s| key.matches(s.as_ref())))
            .filter_map(|(_, e)| e.current.clone())
            .map(|s| (s.key.clone(), s))
            .collect()
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<MetricKey> {
        let mut keys: Vec<MetricKey> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Owner of `key`, if registered.
    pub fn owner(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|e| e.owner.clone())
    }

    /// Guard counters for `key`, if registered.
    pub fn guard_stats(&self, key: &str) -> Option<GuardStats> {
        self.entries
            .read()
            .get(key)
            .map(|e| GuardStats {
                rejected: e.rejected,
                last_rejected_at: e.last_rejected_at,
            })
    }
}
