//! Runtime-mutable collection cadence.
//!
//! Collectors poll at the fast interval while the interactive class has a
//! live connection and at the operator-chosen slow interval otherwise. The
//! slow interval is restricted to an enumerated set of allowed values.
//! Changes are published on a `watch` channel so sleeping collectors can
//! recompute their deadline immediately.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::config::CadenceConfig;
use crate::error::BtsError;
use crate::types::SubscriberClass;

/// Current cadence values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    /// Class whose presence switches collectors to the fast interval.
    pub interactive_class: SubscriberClass,
    pub fast: Duration,
    pub slow: Duration,
}

/// Operator-facing holder of the [`Cadence`].
pub struct CadenceSettings {
    allowed_slow: Vec<Duration>,
    tx: watch::Sender<Cadence>,
}

impl CadenceSettings {
    pub fn new(cadence: Cadence, mut allowed_slow: Vec<Duration>) -> Result<Self, BtsError> {
        allowed_slow.sort();
        allowed_slow.dedup();
        if allowed_slow.is_empty() {
            return Err(BtsError::Config("allowed slow intervals must not be empty".into()));
        }
        check_fast(cadence.fast)?;
        check_slow(&allowed_slow, cadence.slow)?;
        let (tx, _rx) = watch::channel(cadence);
        Ok(Self { allowed_slow, tx })
    }

    pub fn from_config(cfg: &CadenceConfig) -> Result<Self, BtsError> {
        let cadence = Cadence {
            interactive_class: cfg.effective_interactive_class().into(),
            fast: Duration::from_secs(cfg.effective_fast_interval_sec()),
            slow: Duration::from_secs(cfg.effective_slow_interval_sec()),
        };
        let allowed = cfg
            .effective_allowed_slow_intervals_sec()
            .into_iter()
            .map(Duration::from_secs)
            .collect();
        Self::new(cadence, allowed)
    }

    pub fn current(&self) -> Cadence {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Cadence> {
        self.tx.subscribe()
    }

    pub fn allowed_slow_intervals(&self) -> &[Duration] {
        &self.allowed_slow
    }

    /// Set the slow (background) interval; must be one of the allowed values.
    pub fn set_slow_interval(&self, slow: Duration) -> Result<(), BtsError> {
        check_slow(&self.allowed_slow, slow)?;
        if self.tx.send_if_modified(|c| replace(&mut c.slow, slow)) {
            info!("[cadence] slow interval set to {slow:?}");
        }
        Ok(())
    }

    /// Set the fast (interactive) interval.
    pub fn set_fast_interval(&self, fast: Duration) -> Result<(), BtsError> {
        check_fast(fast)?;
        if self.tx.send_if_modified(|c| replace(&mut c.fast, fast)) {
            info!("[cadence] fast interval set to {fast:?}");
        }
        Ok(())
    }
}

fn replace(slot: &mut Duration, value: Duration) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn check_fast(fast: Duration) -> Result<(), BtsError> {
    if fast.is_zero() {
        return Err(BtsError::Config("fast interval must be greater than zero".into()));
    }
    Ok(())
}

fn check_slow(allowed: &[Duration], slow: Duration) -> Result<(), BtsError> {
    if allowed.contains(&slow) {
        return Ok(());
    }
    let secs: Vec<u64> = allowed.iter().map(Duration::as_secs).collect();
    Err(BtsError::Config(format!("slow interval {}s is not one of {secs:?}", slow.as_secs())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CadenceSettings {
        CadenceSettings::from_config(&CadenceConfig::default()).unwrap()
    }

    #[test]
    fn defaults() {
        let s = settings();
        let c = s.current();
        assert_eq!(c.interactive_class.as_str(), "dashboard");
        assert_eq!(c.fast, Duration::from_secs(5));
        assert_eq!(c.slow, Duration::from_secs(60));
        assert_eq!(s.allowed_slow_intervals().len(), 7);
    }

    #[test]
    fn slow_interval_must_be_allowed() {
        let s = settings();
        assert!(s.set_slow_interval(Duration::from_secs(45)).is_err());
        assert_eq!(s.current().slow, Duration::from_secs(60));

        s.set_slow_interval(Duration::from_secs(300)).unwrap();
        assert_eq!(s.current().slow, Duration::from_secs(300));
    }

    #[test]
    fn fast_interval_must_be_positive() {
        let s = settings();
        assert!(s.set_fast_interval(Duration::ZERO).is_err());
        s.set_fast_interval(Duration::from_secs(3)).unwrap();
        assert_eq!(s.current().fast, Duration::from_secs(3));
    }

    #[test]
    fn changes_are_published() {
        let s = settings();
        let mut rx = s.subscribe();
        assert!(!rx.has_changed().unwrap());

        s.set_slow_interval(Duration::from_secs(60)).unwrap();
        assert!(!rx.has_changed().unwrap());

        s.set_slow_interval(Duration::from_secs(10)).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().slow, Duration::from_secs(10));
    }

    #[test]
    fn rejects_slow_outside_allowed_at_startup() {
        let cadence = Cadence {
            interactive_class: "dashboard".into(),
            fast: Duration::from_secs(5),
            slow: Duration::from_secs(45),
        };
        let res = CadenceSettings::new(cadence, vec![Duration::from_secs(60)]);
        assert!(matches!(res, Err(BtsError::Config(_))));
    }
}
