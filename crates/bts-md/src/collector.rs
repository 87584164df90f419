//! Adaptive collector loop: one per data source.
//!
//! ```text
//! Idle ──► Fetching ──► Validating ──► Storing ──► Idle
//!              └──────► Backoff (rate limited) ──► Idle
//! ```
//!
//! Every cycle re-derives the polling interval: the fast interval while the
//! interactive class has a live connection, the operator's slow interval
//! otherwise, never below the source's safe minimum. The next fetch is due at
//! `cycle_end + interval`; while waiting the collector also wakes on activity
//! and cadence changes and recomputes that deadline, fetching at once if the
//! new deadline has already passed. A mode switch therefore takes effect
//! within one cycle.
//!
//! Collectors never give up: every failure is logged and retried on the next
//! cycle. The consecutive-failure counter is observability only.

use std::sync::Arc;
use std::time::Duration;

use bts_core::activity::ActivityTracker;
use bts_core::settings::Cadence;
use bts_core::store::SnapshotStore;
use bts_core::time_util;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fetcher::FetchError;
use crate::source::{MetricBatch, Source};

/// Where a collector is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorPhase {
    Idle,
    Fetching,
    Validating,
    Storing,
    Backoff,
}

/// Published copy of a collector's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStatus {
    pub source: String,
    pub phase: CollectorPhase,
    /// `true` while polling at the fast (interactive) interval.
    pub fast_mode: bool,
    pub current_interval_ms: u64,
    /// Milliseconds since Unix epoch of the last completed fetch attempt.
    pub last_fetch_at: Option<u64>,
    /// Milliseconds since Unix epoch of the last fetch that wrote to the store.
    pub last_success_at: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub cycles: u64,
}

impl CollectorStatus {
    /// Idle status of a collector that has not run yet.
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            phase: CollectorPhase::Idle,
            fast_mode: false,
            current_interval_ms: 0,
            last_fetch_at: None,
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
            cycles: 0,
        }
    }
}

/// State owned by the collector task alone.
struct CollectorState {
    current_interval: Duration,
    fast_mode: bool,
    last_fetch_at: Option<u64>,
    last_success_at: Option<u64>,
    consecutive_failures: u32,
    last_error: Option<String>,
    phase: CollectorPhase,
    cycles: u64,
}

/// Fetch → validate → store loop for one [`Source`].
pub struct Collector {
    source: Arc<dyn Source>,
    store: Arc<SnapshotStore>,
    activity: ActivityTracker,
    cadence: watch::Receiver<Cadence>,
    status_tx: watch::Sender<CollectorStatus>,
    state: CollectorState,
}

impl Collector {
    pub fn new(
        source: Arc<dyn Source>,
        store: Arc<SnapshotStore>,
        activity: ActivityTracker,
        cadence: watch::Receiver<Cadence>,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(CollectorStatus::new(source.id()));
        Self {
            source,
            store,
            activity,
            cadence,
            status_tx,
            state: CollectorState {
                current_interval: Duration::ZERO,
                fast_mode: false,
                last_fetch_at: None,
                last_success_at: None,
                consecutive_failures: 0,
                last_error: None,
                phase: CollectorPhase::Idle,
                cycles: 0,
            },
        }
    }

    pub fn id(&self) -> &str {
        self.source.id()
    }

    /// Receiver of this collector's published status.
    pub fn status(&self) -> watch::Receiver<CollectorStatus> {
        self.status_tx.subscribe()
    }

    /// Interval for the next sleep and whether it is the fast one.
    pub fn target_interval(&self) -> (Duration, bool) {
        let cadence = self.cadence.borrow().clone();
        let fast = self.activity.is_class_active(cadence.interactive_class.as_str());
        let base = if fast { cadence.fast } else { cadence.slow };
        (base.max(self.source.min_interval()), fast)
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let id = self.source.id().to_string();
        let mut activity = self.activity.changes();
        info!("[collector:{id}] started");

        'run: loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_phase(CollectorPhase::Fetching);
            let source = self.source.clone();
            let fetched = tokio::select! {
                res = source.fetch() => res,
                _ = shutdown.changed() => {
                    info!("[collector:{id}] shutdown during fetch, abandoning it");
                    break 'run;
                }
            };
            let rate_limited = self.absorb(fetched);
            let cycle_end = Instant::now();
            self.set_phase(if rate_limited {
                CollectorPhase::Backoff
            } else {
                CollectorPhase::Idle
            });

            loop {
                let (interval, fast) = self.target_interval();
                self.apply_interval(interval, fast);
                let deadline = cycle_end + interval;

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    Ok(()) = activity.changed() => {
                        debug!("[collector:{id}] activity changed, recomputing deadline");
                    }
                    Ok(()) = self.cadence.changed() => {
                        debug!("[collector:{id}] cadence changed, recomputing deadline");
                    }
                    _ = shutdown.changed() => break 'run,
                }
            }
        }

        self.set_phase(CollectorPhase::Idle);
        info!("[collector:{id}] stopped after {} cycles", self.state.cycles);
    }

    /// Validate and store one fetch result. Returns `true` when the failure
    /// was rate-limit related.
    fn absorb(&mut self, fetched: Result<MetricBatch, FetchError>) -> bool {
        let now = time_util::now_ms();
        self.state.cycles += 1;
        self.state.last_fetch_at = Some(now);

        match fetched {
            Ok(batch) => {
                self.set_phase(CollectorPhase::Validating);
                let total = batch.len();
                self.set_phase(CollectorPhase::Storing);
                let mut written = 0;
                for (key, payload) in batch {
                    if self.store.put_at(&key, payload, now) {
                        written += 1;
                    }
                }

                if written > 0 {
                    self.state.consecutive_failures = 0;
                    self.state.last_success_at = Some(now);
                    self.state.last_error = None;
                }
                if written < total {
                    warn!(
                        "[collector:{}] {} of {total} payloads rejected, previous values kept",
                        self.source.id(),
                        total - written
                    );
                } else {
                    debug!("[collector:{}] stored {written} metrics", self.source.id());
                }
                false
            }
            Err(e) => {
                self.state.consecutive_failures += 1;
                warn!(
                    "[collector:{}] fetch failed ({} consecutive): {e}",
                    self.source.id(),
                    self.state.consecutive_failures
                );
                let rate_limited = e.is_rate_limit();
                self.state.last_error = Some(e.to_string());
                rate_limited
            }
        }
    }

    fn apply_interval(&mut self, interval: Duration, fast: bool) {
        if self.state.cycles > 0 && fast != self.state.fast_mode {
            info!(
                "[collector:{}] switching to {} mode, interval {interval:?}",
                self.source.id(),
                if fast { "fast" } else { "slow" }
            );
        }
        self.state.current_interval = interval;
        self.state.fast_mode = fast;
        self.publish();
    }

    fn set_phase(&mut self, phase: CollectorPhase) {
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        let s = &self.state;
        self.status_tx.send_replace(CollectorStatus {
            source: self.source.id().to_string(),
            phase: s.phase,
            fast_mode: s.fast_mode,
            current_interval_ms: s.current_interval.as_millis() as u64,
            last_fetch_at: s.last_fetch_at,
            last_success_at: s.last_success_at,
            consecutive_failures: s.consecutive_failures,
            last_error: s.last_error.clone(),
            cycles: s.cycles,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use bts_core::guard::ValidityRule;
    use bts_core::registry::SubscriptionRegistry;
    use bts_core::settings::CadenceSettings;
    use bts_core::types::MetricKey;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    const KEY: &str = "test.value";

    /// Scripted source: pops one result per fetch, then repeats `fallback`.
    struct FakeSource {
        min_interval: Duration,
        script: Mutex<VecDeque<Result<MetricBatch, FetchError>>>,
        fetch_delay: Duration,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl FakeSource {
        fn new(min_interval: Duration) -> Self {
            Self {
                min_interval,
                script: Mutex::new(VecDeque::new()),
                fetch_delay: Duration::ZERO,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn then(self, result: Result<MetricBatch, FetchError>) -> Self {
            self.script.lock().push_back(result);
            self
        }
    }

    fn good(value: f64) -> Result<MetricBatch, FetchError> {
        Ok(vec![(MetricKey::from(KEY), json!({"value": value}))])
    }

    #[async_trait]
    impl Source for FakeSource {
        fn id(&self) -> &str {
            "fake"
        }

        fn metrics(&self) -> Vec<(MetricKey, ValidityRule)> {
            vec![(KEY.into(), ValidityRule::positive_value())]
        }

        fn min_interval(&self) -> Duration {
            self.min_interval
        }

        async fn fetch(&self) -> Result<MetricBatch, FetchError> {
            self.calls.lock().push(Instant::now());
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            self.script.lock().pop_front().unwrap_or_else(|| good(1.0))
        }
    }

    struct Harness {
        store: Arc<SnapshotStore>,
        registry: Arc<SubscriptionRegistry>,
        settings: CadenceSettings,
    }

    fn harness(fast: u64, slow: u64) -> Harness {
        let store = Arc::new(SnapshotStore::new());
        let rule = ValidityRule::positive_value().into_validator();
        store.register(KEY.into(), "fake", rule).unwrap();
        let settings = CadenceSettings::new(
            Cadence {
                interactive_class: "dashboard".into(),
                fast: Duration::from_secs(fast),
                slow: Duration::from_secs(slow),
            },
            vec![Duration::from_secs(slow), Duration::from_secs(600)],
        )
        .unwrap();
        Harness {
            store,
            registry: Arc::new(SubscriptionRegistry::default()),
            settings,
        }
    }

    impl Harness {
        fn collector(&self, source: Arc<dyn Source>) -> Collector {
            Collector::new(
                source,
                self.store.clone(),
                ActivityTracker::new(self.registry.clone()),
                self.settings.subscribe(),
            )
        }
    }

    fn offsets(start: Instant, calls: &[Instant]) -> Vec<u64> {
        calls.iter().map(|t| t.duration_since(start).as_millis() as u64).collect()
    }

    fn assert_offsets(actual: &[u64], expected_secs: &[u64]) {
        assert_eq!(actual.len(), expected_secs.len(), "fetch offsets {actual:?}");
        for (a, e) in actual.iter().zip(expected_secs) {
            let e = e * 1_000;
            assert!(
                *a >= e && *a < e + 50,
                "fetch offsets {actual:?}, expected {expected_secs:?} s"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_connect_switches_to_fast_within_one_cycle() {
        let h = harness(5, 60);
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let calls = source.calls.clone();
        let collector = h.collector(source);
        let status = collector.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let start = Instant::now();
        let task = tokio::spawn(collector.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(status.borrow().current_interval_ms, 60_000);
        assert!(!status.borrow().fast_mode);

        let (_id, _rx) = h.registry.subscribe("dashboard".into());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_offsets(&offsets(start, &calls.lock()), &[0, 10, 15, 20]);
        assert_eq!(status.borrow().current_interval_ms, 5_000);
        assert!(status.borrow().fast_mode);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_disconnect_returns_to_slow() {
        let h = harness(5, 60);
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let calls = source.calls.clone();
        let (id, _rx) = h.registry.subscribe("dashboard".into());
        let collector = h.collector(source);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let start = Instant::now();
        let task = tokio::spawn(collector.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(12)).await;
        h.registry.unsubscribe(id);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_offsets(&offsets(start, &calls.lock()), &[0, 5, 10, 70]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_interval_change_applies_to_sleeping_collector() {
        let h = harness(5, 60);
        let source = Arc::new(FakeSource::new(Duration::ZERO));
        let calls = source.calls.clone();
        let collector = h.collector(source);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let start = Instant::now();
        let task = tokio::spawn(collector.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.settings.set_slow_interval(Duration::from_secs(600)).unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_offsets(&offsets(start, &calls.lock()), &[0]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn source_minimum_floors_the_fast_interval() {
        let h = harness(5, 60);
        let source = Arc::new(FakeSource::new(Duration::from_secs(30)));
        let calls = source.calls.clone();
        let (_id, _rx) = h.registry.subscribe("dashboard".into());
        let collector = h.collector(source);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let start = Instant::now();
        let task = tokio::spawn(collector.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_offsets(&offsets(start, &calls.lock()), &[0, 30, 60]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_count_until_a_successful_write() {
        let h = harness(5, 60);
        let source = Arc::new(
            FakeSource::new(Duration::ZERO)
                .then(good(57.08))
                .then(Err(FetchError::Transient("connection reset".into())))
                .then(Err(FetchError::RateLimited { retry_after: None }))
                .then(good(0.0))
                .then(good(58.0)),
        );
        let (_id, _rx) = h.registry.subscribe("dashboard".into());
        let collector = h.collector(source);
        let status = collector.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(collector.run(shutdown_rx));

        // fetches at 0, 5, 10, 15, 20
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(status.borrow().consecutive_failures, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(status.borrow().consecutive_failures, 1);
        assert_eq!(status.borrow().phase, CollectorPhase::Idle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(status.borrow().consecutive_failures, 2);
        assert_eq!(status.borrow().phase, CollectorPhase::Backoff);
        assert_eq!(h.store.get(KEY).unwrap().value["value"], 57.08);

        // guard rejection: not a fetch failure, not a successful write
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(status.borrow().consecutive_failures, 2);
        assert_eq!(h.store.get(KEY).unwrap().value["value"], 57.08);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(status.borrow().consecutive_failures, 0);
        assert!(status.borrow().last_error.is_none());
        assert_eq!(h.store.get(KEY).unwrap().value["value"], 58.0);
        assert_eq!(status.borrow().cycles, 5);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_in_flight_fetch() {
        let h = harness(5, 60);
        let mut source = FakeSource::new(Duration::ZERO);
        source.fetch_delay = Duration::from_secs(3_600);
        let collector = h.collector(Arc::new(source));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(collector.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let start = Instant::now();
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(h.store.get(KEY).is_none());
    }
}
