//! Upbit market indices: source definition.
//!
//! Fetches the daily CRIX candle of each index and derives the change from
//! the day's opening price:
//! - `IDX.UPBIT.COMPOSITE` → `upbit.ubci`
//! - `IDX.UPBIT.MARKET` → `upbit.ubmi`
//! - `IDX.UPBIT.TOP10` → `upbit.ub10`

pub mod json_parser;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bts_core::config::SourceConfig;
use bts_core::guard::ValidityRule;
use bts_core::types::MetricKey;
use tracing::warn;

use crate::fetcher::{FetchError, FetcherPool};
use crate::source::{MetricBatch, Source, SourceDefaults, SourceSettings};

const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://crix-api-cdn.upbit.com",
    rate_group: "upbit",
    timeout: Duration::from_secs(8),
    min_interval: Duration::from_secs(6),
};

const CANDLES_PATH: &str = "/v1/crix/candles/days";

/// CRIX index code → metric key.
pub const INDICES: [(&str, &str); 3] = [
    ("IDX.UPBIT.COMPOSITE", "upbit.ubci"),
    ("IDX.UPBIT.MARKET", "upbit.ubmi"),
    ("IDX.UPBIT.TOP10", "upbit.ub10"),
];

/// Build the Upbit index source from its config entry.
pub fn build(cfg: &SourceConfig, fetchers: &FetcherPool) -> Result<Arc<dyn Source>> {
    Ok(Arc::new(UpbitSource {
        settings: SourceSettings::resolve(cfg, &DEFAULTS, fetchers)?,
    }))
}

pub struct UpbitSource {
    settings: SourceSettings,
}

#[async_trait]
impl Source for UpbitSource {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn metrics(&self) -> Vec<(MetricKey, ValidityRule)> {
        INDICES
            .iter()
            .map(|(_, key)| (MetricKey::from(*key), ValidityRule::positive_value()))
            .collect()
    }

    fn min_interval(&self) -> Duration {
        self.settings.min_interval
    }

    async fn fetch(&self) -> Result<MetricBatch, FetchError> {
        let mut batch = Vec::with_capacity(INDICES.len());
        let mut last_error = None;

        for (code, key) in INDICES {
            let query = [("code", code.to_string()), ("count", "1".to_string())];
            match self.settings.get_json(CANDLES_PATH, &query).await {
                Ok(body) => match json_parser::parse_candle(&body) {
                    Some(quote) => batch.push((MetricKey::from(key), quote.to_payload())),
                    None => {
                        warn!("[{}] unexpected candle payload for {code}", self.settings.id);
                        let msg = format!("{code}: unexpected candle payload");
                        last_error = Some(FetchError::Transient(msg));
                    }
                },
                // the whole group is throttled; the remaining indices would fail the same way
                Err(e) if e.is_rate_limit() => {
                    return if batch.is_empty() { Err(e) } else { Ok(batch) };
                }
                Err(e) => {
                    warn!("[{}] {code} failed: {e}", self.settings.id);
                    last_error = Some(e);
                }
            }
        }

        if batch.is_empty() {
            return Err(last_error.unwrap_or_else(|| FetchError::Transient("no index data".into())));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bts_core::config::RateLimitConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn pool() -> FetcherPool {
        let limits = BTreeMap::from([("upbit".to_string(), RateLimitConfig::new(100, 60, 0))]);
        FetcherPool::from_config(&limits).unwrap()
    }

    fn source(base_url: String) -> Arc<dyn Source> {
        let cfg = SourceConfig {
            base_url: Some(base_url),
            ..SourceConfig::named("upbit")
        };
        build(&cfg, &pool()).unwrap()
    }

    async fn mount_candle(server: &MockServer, code: &str, trade: f64, open: f64) {
        Mock::given(method("GET"))
            .and(path(CANDLES_PATH))
            .and(query_param("code", code))
            .and(query_param("count", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"code": code, "tradePrice": trade, "openingPrice": open}
            ])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fetches_every_index() {
        let server = MockServer::start().await;
        mount_candle(&server, "IDX.UPBIT.COMPOSITE", 12_000.0, 11_880.0).await;
        mount_candle(&server, "IDX.UPBIT.MARKET", 9_000.0, 9_000.0).await;
        mount_candle(&server, "IDX.UPBIT.TOP10", 20_000.0, 20_400.0).await;

        let batch = source(server.uri()).fetch().await.unwrap();
        assert_eq!(batch.len(), 3);

        let (key, ubci) = &batch[0];
        assert_eq!(key.as_str(), "upbit.ubci");
        assert_eq!(ubci["value"], 12_000.0);
        assert_eq!(ubci["change"], 120.0);
        assert!((ubci["changeRate"].as_f64().unwrap() - 1.0101).abs() < 1e-3);

        assert_eq!(batch[2].1["change"], -400.0);
    }

    #[tokio::test]
    async fn partial_failure_keeps_successful_indices() {
        let server = MockServer::start().await;
        mount_candle(&server, "IDX.UPBIT.COMPOSITE", 12_000.0, 11_880.0).await;
        Mock::given(method("GET"))
            .and(path(CANDLES_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let batch = source(server.uri()).fetch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0.as_str(), "upbit.ubci");
    }

    #[tokio::test]
    async fn total_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

        let err = source(server.uri()).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }

    #[test]
    fn declares_index_keys() {
        let src = build(&SourceConfig::named("upbit"), &pool()).unwrap();
        let keys: Vec<String> = src.metrics().into_iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, ["upbit.ubci", "upbit.ubmi", "upbit.ub10"]);
        assert_eq!(src.min_interval(), Duration::from_secs(6));
    }
}
