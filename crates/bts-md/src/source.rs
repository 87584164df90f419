//! The `Source` capability and per-source settings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bts_core::config::SourceConfig;
use bts_core::guard::ValidityRule;
use bts_core::types::MetricKey;
use serde_json::Value;

use crate::fetcher::{FetchError, FetcherPool, RateLimitedFetcher};

/// One batch of fetched payloads, keyed by the metric they belong to.
pub type MetricBatch = Vec<(MetricKey, Value)>;

/// An upstream data source polled by a [`Collector`](crate::collector::Collector).
///
/// A source only fetches and normalizes; validation against its
/// [`metrics`](Source::metrics) rules and storage are done by the store.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier, also the owner name of its keys in the store.
    fn id(&self) -> &str;

    /// Keys this source writes, each with its default validity rule.
    fn metrics(&self) -> Vec<(MetricKey, ValidityRule)>;

    /// Safe minimum polling interval for this upstream.
    fn min_interval(&self) -> Duration;

    /// Fetch one batch. A batch may cover a subset of [`metrics`](Source::metrics)
    /// when part of a multi-request fetch failed; an empty result is reported
    /// as an error instead.
    async fn fetch(&self) -> Result<MetricBatch, FetchError>;
}

/// Built-in defaults of one source kind.
#[derive(Debug, Clone, Copy)]
pub struct SourceDefaults {
    pub base_url: &'static str,
    pub rate_group: &'static str,
    pub timeout: Duration,
    pub min_interval: Duration,
}

/// Settings resolved from a [`SourceConfig`] over a kind's [`SourceDefaults`].
#[derive(Clone)]
pub struct SourceSettings {
    pub id: String,
    /// Base URL without a trailing slash.
    pub base_url: String,
    pub timeout: Duration,
    pub min_interval: Duration,
    pub fetcher: Arc<RateLimitedFetcher>,
}

impl SourceSettings {
    pub fn resolve(
        cfg: &SourceConfig,
        defaults: &SourceDefaults,
        fetchers: &FetcherPool,
    ) -> Result<Self> {
        let group = cfg.rate_group.as_deref().unwrap_or(defaults.rate_group);
        let fetcher = fetchers
            .get(group)
            .ok_or_else(|| anyhow!("source '{}': no rate limit group '{group}'", cfg.label()))?;
        let base_url = cfg
            .base_url
            .as_deref()
            .unwrap_or(defaults.base_url)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            id: cfg.label(),
            base_url,
            timeout: cfg.timeout_sec.map_or(defaults.timeout, Duration::from_secs),
            min_interval: cfg.min_interval_sec.map_or(defaults.min_interval, Duration::from_secs),
            fetcher,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        self.fetcher
            .get_json(&self.url(path), query, self.timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bts_core::config::RateLimitConfig;

    use super::*;

    const DEFAULTS: SourceDefaults = SourceDefaults {
        base_url: "https://api.example.com/",
        rate_group: "example",
        timeout: Duration::from_secs(10),
        min_interval: Duration::from_secs(3),
    };

    fn pool() -> FetcherPool {
        let cfg = RateLimitConfig {
            max_requests: 10,
            window_sec: 60,
            min_interval_ms: None,
            max_wait_ms: None,
            cooldown_sec: None,
        };
        FetcherPool::from_config(&BTreeMap::from([("example".to_string(), cfg)])).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cfg = SourceConfig::named("example_src");
        let s = SourceSettings::resolve(&cfg, &DEFAULTS, &pool()).unwrap();
        assert_eq!(s.id, "example_src");
        assert_eq!(s.url("/v1/x"), "https://api.example.com/v1/x");
        assert_eq!(s.timeout, Duration::from_secs(10));
        assert_eq!(s.min_interval, Duration::from_secs(3));
        assert_eq!(s.fetcher.group(), "example");
    }

    #[test]
    fn overrides_apply() {
        let cfg = SourceConfig {
            source: "example_src".into(),
            label: Some("primary".into()),
            base_url: Some("http://127.0.0.1:9999".into()),
            timeout_sec: Some(2),
            min_interval_sec: Some(30),
            ..Default::default()
        };
        let s = SourceSettings::resolve(&cfg, &DEFAULTS, &pool()).unwrap();
        assert_eq!(s.id, "primary");
        assert_eq!(s.url("/a"), "http://127.0.0.1:9999/a");
        assert_eq!(s.min_interval, Duration::from_secs(30));
    }

    #[test]
    fn unknown_group_fails() {
        let cfg = SourceConfig {
            rate_group: Some("missing".into()),
            ..SourceConfig::named("x")
        };
        assert!(SourceSettings::resolve(&cfg, &DEFAULTS, &pool()).is_err());
    }
}
