//! Rate-limited upstream fetching.
//!
//! One [`RateLimitedFetcher`] exists per upstream rate-limit group and is
//! shared by every source in that group. It combines:
//!
//! - a [`RateBudget`]: sliding-window request budget plus minimum spacing;
//!   callers over budget block until a token frees, bounded by `max_wait`
//! - a [`BackoffGate`]: after an upstream 429 the group refuses new attempts
//!   for a cool-down window without touching the network
//!
//! Failures are classified into [`FetchError`]; nothing here retries.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::Result;
use bts_core::config::RateLimitConfig;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Classified fetch failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Network, HTTP status or parse failure; safe to retry next cycle.
    #[error("transient: {0}")]
    Transient(String),

    /// Over budget (local) or told to slow down (upstream 429).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The group is cooling down after a 429; no request was sent.
    #[error("backing off for {remaining:?}")]
    Backoff { remaining: Duration },
}

impl FetchError {
    /// Rate-limit related failures put the collector into its backoff phase.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Backoff { .. })
    }
}

// ---------------------------------------------------------------------------
// RateBudget
// ---------------------------------------------------------------------------

/// Sliding-window request budget with minimum spacing.
pub struct RateBudget {
    max_requests: usize,
    window: Duration,
    min_interval: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateBudget {
    pub fn new(max_requests: u32, window: Duration, min_interval: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window,
            min_interval,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.max_requests, cfg.window(), cfg.effective_min_interval())
    }

    /// Take a token at `now`, or return how long until one frees.
    pub fn try_take(&self, now: Instant) -> Result<(), Duration> {
        let mut sent = self.sent.lock();
        while let Some(&oldest) = sent.front() {
            if now.duration_since(oldest) >= self.window {
                sent.pop_front();
            } else {
                break;
            }
        }

        let mut wait = Duration::ZERO;
        if sent.len() >= self.max_requests {
            if let Some(&oldest) = sent.front() {
                wait = self.window.saturating_sub(now.duration_since(oldest));
            }
        }
        if let Some(&last) = sent.back() {
            let since = now.duration_since(last);
            if since < self.min_interval {
                wait = wait.max(self.min_interval - since);
            }
        }

        if wait.is_zero() {
            sent.push_back(now);
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Block until a token is available, failing with
    /// [`FetchError::RateLimited`] if that would take longer than `max_wait`.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), FetchError> {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            match self.try_take(now) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    if now.duration_since(started) + wait > max_wait {
                        return Err(FetchError::RateLimited {
                            retry_after: Some(wait),
                        });
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Requests recorded inside the current window.
    pub fn recorded_in_window(&self) -> usize {
        let now = Instant::now();
        self.sent
            .lock()
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

// ---------------------------------------------------------------------------
// BackoffGate
// ---------------------------------------------------------------------------

/// Cool-down after an upstream "too many requests".
#[derive(Default)]
pub struct BackoffGate {
    until: Mutex<Option<Instant>>,
}

impl BackoffGate {
    /// Remaining cool-down at `now`, or `None` when closed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let mut until = self.until.lock();
        match *until {
            Some(t) if t > now => Some(t - now),
            Some(_) => {
                *until = None;
                None
            }
            None => None,
        }
    }

    /// Refuse attempts for `duration` from `now`; never shortens a running
    /// cool-down.
    pub fn engage(&self, now: Instant, duration: Duration) {
        let target = now + duration;
        let mut until = self.until.lock();
        *until = Some(until.map_or(target, |t| t.max(target)));
    }
}

// ---------------------------------------------------------------------------
// RateLimitedFetcher
// ---------------------------------------------------------------------------

/// HTTP JSON fetcher for one rate-limit group.
pub struct RateLimitedFetcher {
    group: String,
    client: reqwest::Client,
    budget: RateBudget,
    backoff: BackoffGate,
    cooldown: Duration,
    max_wait: Duration,
}

impl RateLimitedFetcher {
    pub fn new(group: &str, cfg: &RateLimitConfig, client: reqwest::Client) -> Self {
        Self {
            group: group.to_string(),
            client,
            budget: RateBudget::from_config(cfg),
            backoff: BackoffGate::default(),
            cooldown: cfg.effective_cooldown(),
            max_wait: cfg.effective_max_wait(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Remaining cool-down, if the group is backing off.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        self.backoff.remaining(Instant::now())
    }

    /// GET `url` with `query` and decode the body as JSON.
    ///
    /// Order of checks: cool-down (no network), budget (may block up to
    /// `max_wait`), then the request itself.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        if let Some(remaining) = self.backoff.remaining(Instant::now()) {
            debug!("[fetch:{}] cooling down, {url} skipped ({remaining:?} left)", self.group);
            return Err(FetchError::Backoff { remaining });
        }

        self.budget.acquire(self.max_wait).await?;

        let resp = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: {e}")))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(resp.headers());
            let cooldown = retry_after.map_or(self.cooldown, |r| r.max(self.cooldown));
            self.backoff.engage(Instant::now(), cooldown);
            warn!("[fetch:{}] 429 from {url}, backing off for {cooldown:?}", self.group);
            return Err(FetchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("{url}: HTTP {status}")));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: invalid JSON: {e}")))
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// FetcherPool
// ---------------------------------------------------------------------------

/// One shared fetcher per rate-limit group.
pub struct FetcherPool {
    fetchers: AHashMap<String, Arc<RateLimitedFetcher>>,
}

impl FetcherPool {
    pub fn from_config(groups: &BTreeMap<String, RateLimitConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bts-feed/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let fetchers = groups
            .iter()
            .map(|(name, cfg)| {
                info!(
                    "[fetch:{name}] budget {} req / {:?}, min spacing {:?}",
                    cfg.max_requests,
                    cfg.window(),
                    cfg.effective_min_interval()
                );
                (name.clone(), Arc::new(RateLimitedFetcher::new(name, cfg, client.clone())))
            })
            .collect();
        Ok(Self { fetchers })
    }

    pub fn get(&self, group: &str) -> Option<Arc<RateLimitedFetcher>> {
        self.fetchers.get(group).cloned()
    }
}
