//! Subscription registry: class policies and live connections.
//!
//! Two independent locks, never held together:
//!
//! - a `Mutex` over the connection table (per-class id sets, so the live
//!   count of a class is an O(1) lookup)
//! - an `RwLock` over class configuration (broadcast policy + key selectors)
//!
//! Every lifecycle or policy change bumps a `watch` version counter after
//! the lock is released, which lets collectors react to a mode switch
//! without polling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::time_util;
use crate::types::{BroadcastPolicy, Connection, ConnectionId, PushFrame, SubscriberClass};

/// Default bounded queue depth of one connection.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

struct Slot {
    info: Connection,
    tx: mpsc::Sender<PushFrame>,
}

#[derive(Default)]
struct ConnectionTable {
    by_id: AHashMap<ConnectionId, Slot>,
    by_class: AHashMap<SubscriberClass, AHashSet<ConnectionId>>,
}

impl ConnectionTable {
    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.by_id.remove(&id)?;
        if let Some(ids) = self.by_class.get_mut(&slot.info.class) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_class.remove(&slot.info.class);
            }
        }
        Some(slot.info)
    }
}

/// Broadcast configuration of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassConfig {
    pub policy: BroadcastPolicy,
    /// Metric selectors pushed to this class (`"*"`, `"prefix.*"`, exact key).
    pub keys: Vec<String>,
}

/// Live subscriber connections and per-class broadcast policy.
pub struct SubscriptionRegistry {
    connections: Mutex<ConnectionTable>,
    classes: RwLock<AHashMap<SubscriberClass, ClassConfig>>,
    next_id: AtomicU64,
    queue_depth: usize,
    changes: watch::Sender<u64>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl SubscriptionRegistry {
    pub fn new(queue_depth: usize) -> Self {
        let (changes, _rx) = watch::channel(0);
        Self {
            connections: Mutex::new(ConnectionTable::default()),
            classes: RwLock::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            changes,
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Register a new connection under `class`.
    ///
    /// Returns its id and the receiving end of its bounded push queue. The
    /// queue closes when the connection is unsubscribed (explicitly or after
    /// a failed send).
    pub fn subscribe(&self, class: SubscriberClass) -> (ConnectionId, mpsc::Receiver<PushFrame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let info = Connection {
            id,
            class: class.clone(),
            connected_at: time_util::now_ms(),
        };
        let count = {
            let mut table = self.connections.lock();
            table.by_id.insert(id, Slot { info, tx });
            let ids = table.by_class.entry(class.clone()).or_default();
            ids.insert(id);
            ids.len()
        };
        self.bump();
        info!("[registry] {id} subscribed to '{class}' ({count} live)");
        (id, rx)
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        let removed = self.connections.lock().remove(id);
        match removed {
            Some(conn) => {
                self.bump();
                info!("[registry] {id} unsubscribed from '{}'", conn.class);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the live connections of `class`.
    pub fn list_connections(&self, class: &str) -> Vec<Connection> {
        let table = self.connections.lock();
        let Some(ids) = table.by_class.get(class) else {
            return Vec::new();
        };
        let mut conns: Vec<Connection> = ids
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .map(|s| s.info.clone())
            .collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    /// Push queues of the live connections of `class`, cloned out of the lock.
    pub fn senders(&self, class: &str) -> Vec<(ConnectionId, mpsc::Sender<PushFrame>)> {
        let table = self.connections.lock();
        let Some(ids) = table.by_class.get(class) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| table.by_id.get(id).map(|s| (*id, s.tx.clone())))
            .collect()
    }

    /// Live connection count of `class`.
    pub fn connection_count(&self, class: &str) -> usize {
        self.connections
            .lock()
            .by_class
            .get(class)
            .map_or(0, |ids| ids.len())
    }

    pub fn total_connections(&self) -> usize {
        self.connections.lock().by_id.len()
    }

    /// Live connection count per class, including unconfigured classes.
    pub fn connection_counts(&self) -> BTreeMap<SubscriberClass, usize> {
        let table = self.connections.lock();
        table
            .by_class
            .iter()
            .map(|(class, ids)| (class.clone(), ids.len()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------------

    /// Broadcast policy of `class`; unknown classes are disabled.
    pub fn get_policy(&self, class: &str) -> BroadcastPolicy {
        self.classes
            .read()
            .get(class)
            .map(|c| c.policy)
            .unwrap_or(BroadcastPolicy::DISABLED)
    }

    /// Metric selectors of `class`; unknown classes select nothing.
    pub fn class_keys(&self, class: &str) -> Vec<String> {
        self.classes
            .read()
            .get(class)
            .map(|c| c.keys.clone())
            .unwrap_or_default()
    }

    /// Set the policy of `class`. `keys = None` keeps the current selectors
    /// (or selects everything for a new class).
    pub fn set_policy(
        &self,
        class: SubscriberClass,
        policy: BroadcastPolicy,
        keys: Option<Vec<String>>,
    ) {
        {
            let mut classes = self.classes.write();
            match classes.get_mut(&class) {
                Some(cfg) => {
                    cfg.policy = policy;
                    if let Some(keys) = keys {
                        cfg.keys = keys;
                    }
                }
                None => {
                    let keys = keys.unwrap_or_else(|| vec!["*".to_string()]);
                    classes.insert(class.clone(), ClassConfig { policy, keys });
                }
            }
        }
        self.bump();
        info!(
            "[registry] policy for '{class}': enabled={} interval={:?}",
            policy.enabled, policy.interval
        );
    }

    /// Every configured class and its configuration, sorted by name.
    pub fn classes(&self) -> BTreeMap<SubscriberClass, ClassConfig> {
        self.classes
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Change notification
    // -----------------------------------------------------------------------

    /// Receiver bumped after every subscribe, unsubscribe or policy change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::types::PushMessage;

    #[test]
    fn unknown_class_is_disabled() {
        let reg = SubscriptionRegistry::default();
        assert_eq!(reg.get_policy("screening"), BroadcastPolicy::DISABLED);
        assert!(reg.class_keys("screening").is_empty());
        assert!(!reg.get_policy("screening").is_schedulable());
    }

    #[test]
    fn subscribe_and_unsubscribe() {
        let reg = SubscriptionRegistry::default();
        let (a, _rx_a) = reg.subscribe("dashboard".into());
        let (b, _rx_b) = reg.subscribe("dashboard".into());
        let (c, _rx_c) = reg.subscribe("screening".into());

        assert_eq!(reg.connection_count("dashboard"), 2);
        assert_eq!(reg.connection_count("screening"), 1);
        assert_eq!(reg.total_connections(), 3);
        let ids: Vec<ConnectionId> = reg
            .list_connections("dashboard")
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![a, b]);

        assert!(reg.unsubscribe(a));
        assert!(!reg.unsubscribe(a));
        assert!(reg.unsubscribe(c));
        assert_eq!(reg.connection_count("dashboard"), 1);
        assert_eq!(reg.connection_count("screening"), 0);
        assert!(!reg.connection_counts().contains_key("screening"));
    }

    #[test]
    fn unsubscribe_closes_queue() {
        let reg = SubscriptionRegistry::default();
        let (id, mut rx) = reg.subscribe("dashboard".into());
        let senders = reg.senders("dashboard");
        assert_eq!(senders.len(), 1);
        drop(senders);

        reg.unsubscribe(id);
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn queue_is_bounded() {
        let reg = SubscriptionRegistry::new(2);
        let (_id, _rx) = reg.subscribe("dashboard".into());
        let (_, tx) = reg.senders("dashboard").remove(0);
        let frame = Arc::new(PushMessage::from_snapshots("dashboard".into(), 0, Vec::new()));
        assert!(tx.try_send(frame.clone()).is_ok());
        assert!(tx.try_send(frame.clone()).is_ok());
        assert!(tx.try_send(frame).is_err());
    }

    #[test]
    fn set_policy_keeps_keys_when_omitted() {
        let reg = SubscriptionRegistry::default();
        let every_5s = BroadcastPolicy::every(Duration::from_secs(5));
        reg.set_policy("dashboard".into(), every_5s, Some(vec!["upbit.*".into()]));
        reg.set_policy("dashboard".into(), BroadcastPolicy::DISABLED, None);

        assert_eq!(reg.get_policy("dashboard"), BroadcastPolicy::DISABLED);
        assert_eq!(reg.class_keys("dashboard"), vec!["upbit.*".to_string()]);

        reg.set_policy(
            "portfolio".into(),
            BroadcastPolicy::every(Duration::from_secs(30)),
            None,
        );
        assert_eq!(reg.class_keys("portfolio"), vec!["*".to_string()]);
        assert_eq!(reg.classes().len(), 2);
    }

    #[test]
    fn changes_are_signalled() {
        let reg = SubscriptionRegistry::default();
        let mut rx = reg.changes();
        let (id, _q) = reg.subscribe("dashboard".into());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        reg.unsubscribe(id);
        assert!(rx.has_changed().unwrap());
    }
}
