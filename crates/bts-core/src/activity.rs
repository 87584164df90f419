//! Activity tracker: "is an interactive class connected right now?".
//!
//! A read-only view over the [`SubscriptionRegistry`]: the predicate is the
//! registry's live count, so a connect or disconnect is visible to the very
//! next read.

use std::sync::Arc;

use tokio::sync::watch;

use crate::registry::SubscriptionRegistry;

#[derive(Clone)]
pub struct ActivityTracker {
    registry: Arc<SubscriptionRegistry>,
}

impl ActivityTracker {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// `true` while `class` has at least one live connection.
    #[inline]
    pub fn is_class_active(&self, class: &str) -> bool {
        self.registry.connection_count(class) > 0
    }

    /// Receiver that changes whenever connections or policies change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.registry.changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_connection_lifecycle() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let tracker = ActivityTracker::new(registry.clone());
        assert!(!tracker.is_class_active("dashboard"));

        let (id, _rx) = registry.subscribe("dashboard".into());
        assert!(tracker.is_class_active("dashboard"));
        assert!(!tracker.is_class_active("screening"));

        registry.unsubscribe(id);
        assert!(!tracker.is_class_active("dashboard"));
    }
}
