//! Minimal-wait broadcaster.
//!
//! One task serves every subscriber class. Each pass:
//!
//! 1. For every schedulable class with at least one live connection, compute
//!    `due_in = max(0, interval - (now - last_sent))`. A class that has just
//!    become eligible (first connection, enabled, or given a non-zero
//!    interval) starts its interval at that pass.
//! 2. Push to every class that is due and restart its interval.
//! 3. Sleep until the earliest `due_in`, or the idle interval when no class
//!    has a connection.
//!
//! The sleep ends early on shutdown and on any registry change, so a new
//! connection or policy update is scheduled at once instead of waiting out a
//! longer class's interval. A class disabled mid-run simply stops receiving
//! pushes.
//!
//! Delivery is a `try_send` into each connection's bounded queue. A closed or
//! full queue removes that connection from the registry; other connections,
//! in this class or another, are unaffected.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bts_core::registry::SubscriptionRegistry;
use bts_core::store::SnapshotStore;
use bts_core::time_util;
use bts_core::types::{PushMessage, SubscriberClass};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Broadcaster {
    store: Arc<SnapshotStore>,
    registry: Arc<SubscriptionRegistry>,
    idle: Duration,
    last_sent: AHashMap<SubscriberClass, Instant>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<SnapshotStore>,
        registry: Arc<SubscriptionRegistry>,
        idle: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            idle,
            last_sent: AHashMap::new(),
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("[broadcast] started, idle interval {:?}", self.idle);
        let mut changes = self.registry.changes();
        loop {
            if *shutdown.borrow() {
                break;
            }
            changes.borrow_and_update();
            let wait = self.pass(Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                Ok(()) = changes.changed() => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("[broadcast] stopped");
    }

    /// Push to every due class; returns how long to sleep before the next pass.
    fn pass(&mut self, now: Instant) -> Duration {
        let mut next: Option<Duration> = None;

        for (class, cfg) in self.registry.classes() {
            if !cfg.policy.is_schedulable() || self.registry.connection_count(class.as_str()) == 0 {
                self.last_sent.remove(&class);
                continue;
            }
            let interval = cfg.policy.interval;
            let Some(&sent) = self.last_sent.get(&class) else {
                debug!("[broadcast] '{class}' became eligible, first push in {interval:?}");
                self.last_sent.insert(class, now);
                next = Some(next.map_or(interval, |n| n.min(interval)));
                continue;
            };
            let due_in = interval.saturating_sub(now.saturating_duration_since(sent));

            let due_in = if due_in.is_zero() {
                self.push(&class, &cfg.keys);
                self.last_sent.insert(class, now);
                interval
            } else {
                due_in
            };
            next = Some(next.map_or(due_in, |n| n.min(due_in)));
        }

        next.unwrap_or(self.idle)
    }

    fn push(&self, class: &SubscriberClass, keys: &[String]) {
        let senders = self.registry.senders(class.as_str());
        if senders.is_empty() {
            return;
        }

        let snapshots = self.store.select(keys);
        let frame = Arc::new(PushMessage::from_snapshots(
            class.clone(),
            time_util::now_ms(),
            snapshots.into_values(),
        ));

        let mut delivered = 0;
        for (id, tx) in senders {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("[broadcast] {id} in '{class}' is not draining its queue, dropping it");
                    self.registry.unsubscribe(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[broadcast] {id} in '{class}' is gone");
                    self.registry.unsubscribe(id);
                }
            }
        }
        debug!("[broadcast] '{class}': {} metrics to {delivered} connections", frame.metrics.len());
    }
}
