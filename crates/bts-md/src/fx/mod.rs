//! USD/KRW exchange rate from the jsDelivr-hosted currency API.
//!
//! Two requests per cycle: the latest USD table and the table from two days
//! earlier, which is the baseline for the change. A failed baseline request
//! still publishes the rate with a zero change.

pub mod json_parser;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bts_core::config::SourceConfig;
use bts_core::guard::ValidityRule;
use bts_core::types::MetricKey;
use chrono::{Days, NaiveDate, Utc};
use serde_json::json;
use tracing::debug;

use crate::fetcher::{FetchError, FetcherPool};
use crate::json_util::change_rate;
use crate::source::{MetricBatch, Source, SourceDefaults, SourceSettings};

const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://cdn.jsdelivr.net",
    rate_group: "currency_api",
    timeout: Duration::from_secs(10),
    min_interval: Duration::from_secs(3_600),
};

pub const USD_KRW: &str = "fx.usdKrw";

/// Days between the latest table and the baseline table.
const BASELINE_LAG_DAYS: u64 = 2;

pub fn build(cfg: &SourceConfig, fetchers: &FetcherPool) -> Result<Arc<dyn Source>> {
    Ok(Arc::new(FxSource {
        settings: SourceSettings::resolve(cfg, &DEFAULTS, fetchers)?,
    }))
}

/// Path of the USD table for `tag`: `latest` or a `YYYY-MM-DD` date.
fn table_path(tag: &str) -> String {
    format!("/npm/@fawazahmed0/currency-api@{tag}/v1/currencies/usd.json")
}

fn baseline_date(today: NaiveDate) -> NaiveDate {
    today.checked_sub_days(Days::new(BASELINE_LAG_DAYS)).unwrap_or(today)
}

pub struct FxSource {
    settings: SourceSettings,
}

impl FxSource {
    async fn rate(&self, tag: &str) -> Result<f64, FetchError> {
        let body = self.settings.get_json(&table_path(tag), &[]).await?;
        json_parser::parse_usd_krw(&body)
            .ok_or_else(|| FetchError::Transient(format!("currency table {tag}: usd.krw missing")))
    }
}

#[async_trait]
impl Source for FxSource {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn metrics(&self) -> Vec<(MetricKey, ValidityRule)> {
        vec![(USD_KRW.into(), ValidityRule::positive_value())]
    }

    fn min_interval(&self) -> Duration {
        self.settings.min_interval
    }

    async fn fetch(&self) -> Result<MetricBatch, FetchError> {
        let current = self.rate("latest").await?;

        let date = baseline_date(Utc::now().date_naive()).format("%Y-%m-%d").to_string();
        let (change, rate) = match self.rate(&date).await {
            Ok(base) if base > 0.0 => (current - base, change_rate(current, base)),
            Ok(_) => (0.0, 0.0),
            Err(e) => {
                debug!("[{}] baseline {date} unavailable: {e}", self.settings.id);
                (0.0, 0.0)
            }
        };

        Ok(vec![(USD_KRW.into(), json!({"value": current, "change": change, "changeRate": rate}))])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bts_core::config::RateLimitConfig;
    use bts_core::store::SnapshotStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn source(base_url: String) -> Arc<dyn Source> {
        let limits = BTreeMap::from([(
            "currency_api".to_string(),
            RateLimitConfig::new(100, 3_600, 0),
        )]);
        let pool = FetcherPool::from_config(&limits).unwrap();
        let cfg = SourceConfig {
            base_url: Some(base_url),
            ..SourceConfig::named("fx")
        };
        build(&cfg, &pool).unwrap()
    }

    async fn mount_table(server: &MockServer, date: &str, krw: f64) {
        let body = json!({"date": "2026-01-01", "usd": {"krw": krw, "jpy": 150.1}});
        Mock::given(method("GET"))
            .and(path(table_path(date)))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn baseline_is_two_days_back() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(baseline_date(today), NaiveDate::from_ymd_opt(2026, 2, 27).unwrap());
        assert_eq!(
            table_path("latest"),
            "/npm/@fawazahmed0/currency-api@latest/v1/currencies/usd.json"
        );
    }

    #[tokio::test]
    async fn change_against_baseline() {
        let server = MockServer::start().await;
        mount_table(&server, "latest", 1_400.0).await;
        let date = baseline_date(Utc::now().date_naive()).format("%Y-%m-%d").to_string();
        mount_table(&server, &date, 1_386.0).await;

        let batch = source(server.uri()).fetch().await.unwrap();
        assert_eq!(batch.len(), 1);
        let (key, payload) = &batch[0];
        assert_eq!(key.as_str(), USD_KRW);
        assert_eq!(payload["value"], 1_400.0);
        assert_eq!(payload["change"], 14.0);
        assert!((payload["changeRate"].as_f64().unwrap() - 1.0101).abs() < 1e-3);
    }

    #[tokio::test]
    async fn missing_baseline_means_zero_change() {
        let server = MockServer::start().await;
        mount_table(&server, "latest", 1_400.0).await;

        let batch = source(server.uri()).fetch().await.unwrap();
        assert_eq!(batch[0].1["value"], 1_400.0);
        assert_eq!(batch[0].1["change"], 0.0);
        assert_eq!(batch[0].1["changeRate"], 0.0);
    }

    #[tokio::test]
    async fn latest_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"usd": {}})))
            .mount(&server)
            .await;

        assert!(matches!(source(server.uri()).fetch().await, Err(FetchError::Transient(_))));
    }

    #[tokio::test]
    async fn zero_rate_is_left_to_the_store_guard() {
        let server = MockServer::start().await;
        mount_table(&server, "latest", 0.0).await;

        let fx = source(server.uri());
        let (key, payload) = fx.fetch().await.unwrap().remove(0);
        assert_eq!(payload["value"], 0.0);

        let store = SnapshotStore::new();
        let (_, rule) = fx.metrics().remove(0);
        store.register(key.clone(), fx.id(), rule.into_validator()).unwrap();
        assert!(!store.put(&key, payload.clone()));
        assert_eq!(store.guard_stats(USD_KRW).unwrap().rejected, 1);

        let always = ValidityRule::Always.into_validator();
        store.register(key.clone(), fx.id(), always).unwrap();
        assert!(store.put(&key, payload));
    }
}
