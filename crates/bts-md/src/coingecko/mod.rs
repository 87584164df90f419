//! CoinGecko sources: global market aggregates and the top coin list.
//!
//! Both kinds default to the shared `coingecko` rate group, so their requests
//! draw from one budget and one 429 cool-down.

pub mod json_parser;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bts_core::config::SourceConfig;
use bts_core::guard::ValidityRule;
use bts_core::types::MetricKey;
use serde_json::Value;

use crate::fetcher::{FetchError, FetcherPool};
use crate::source::{MetricBatch, Source, SourceDefaults, SourceSettings};

const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://api.coingecko.com",
    rate_group: "coingecko",
    timeout: Duration::from_secs(10),
    min_interval: Duration::from_secs(3),
};

const GLOBAL_PATH: &str = "/api/v3/global";
const MARKETS_PATH: &str = "/api/v3/coins/markets";

pub const TOP_COINS: &str = "coins.top";
pub const DEFAULT_TOP_LIMIT: u32 = 10;

// ---------------------------------------------------------------------------
// Global aggregates
// ---------------------------------------------------------------------------

pub fn build_global(cfg: &SourceConfig, fetchers: &FetcherPool) -> Result<Arc<dyn Source>> {
    Ok(Arc::new(GlobalSource {
        settings: SourceSettings::resolve(cfg, &DEFAULTS, fetchers)?,
    }))
}

pub struct GlobalSource {
    settings: SourceSettings,
}

#[async_trait]
impl Source for GlobalSource {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn metrics(&self) -> Vec<(MetricKey, ValidityRule)> {
        json_parser::GLOBAL_FIELDS
            .iter()
            .map(|f| {
                // the 24h change is legitimately zero or negative
                let rule = if f.signed {
                    ValidityRule::Present {
                        fields: vec!["/value".into()],
                    }
                } else {
                    ValidityRule::positive_value()
                };
                (MetricKey::from(f.key), rule)
            })
            .collect()
    }

    fn min_interval(&self) -> Duration {
        self.settings.min_interval
    }

    async fn fetch(&self) -> Result<MetricBatch, FetchError> {
        let body = self.settings.get_json(GLOBAL_PATH, &[]).await?;
        let batch = json_parser::parse_global(&body);
        if batch.is_empty() {
            return Err(FetchError::Transient("global: no aggregates in response".into()));
        }
        Ok(batch)
    }
}

// ---------------------------------------------------------------------------
// Top coins by market cap
// ---------------------------------------------------------------------------

pub fn build_markets(cfg: &SourceConfig, fetchers: &FetcherPool) -> Result<Arc<dyn Source>> {
    Ok(Arc::new(MarketsSource {
        settings: SourceSettings::resolve(cfg, &DEFAULTS, fetchers)?,
        limit: cfg.limit.unwrap_or(DEFAULT_TOP_LIMIT),
    }))
}

pub struct MarketsSource {
    settings: SourceSettings,
    limit: u32,
}

impl MarketsSource {
    fn query(&self) -> [(&'static str, String); 6] {
        [
            ("vs_currency", "usd".into()),
            ("order", "market_cap_desc".into()),
            ("per_page", self.limit.to_string()),
            ("page", "1".into()),
            ("sparkline", "true".into()),
            ("price_change_percentage", "24h,7d".into()),
        ]
    }
}

#[async_trait]
impl Source for MarketsSource {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn metrics(&self) -> Vec<(MetricKey, ValidityRule)> {
        let rule = ValidityRule::NonEmptyArray {
            field: String::new(),
        };
        vec![(TOP_COINS.into(), rule)]
    }

    fn min_interval(&self) -> Duration {
        self.settings.min_interval
    }

    async fn fetch(&self) -> Result<MetricBatch, FetchError> {
        let body = self.settings.get_json(MARKETS_PATH, &self.query()).await?;
        let coins = json_parser::parse_markets(&body)
            .ok_or_else(|| FetchError::Transient("markets: response is not an array".into()))?;
        Ok(vec![(TOP_COINS.into(), Value::Array(coins))])
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
        let limits = BTreeMap::from([("coingecko".to_string(), RateLimitConfig::new(30, 60, 0))]);
        FetcherPool::from_config(&limits).unwrap()
    }

    fn cfg(kind: &str, base_url: String) -> SourceConfig {
        SourceConfig {
            base_url: Some(base_url),
            ..SourceConfig::named(kind)
        }
    }

    #[tokio::test]
    async fn global_fetch() {
        let server = MockServer::start().await;
        let body = json_parser::tests::global_body();
        Mock::given(method("GET"))
            .and(path(GLOBAL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let src = build_global(&cfg("coingecko_global", server.uri()), &pool()).unwrap();
        let batch = src.fetch().await.unwrap();
        assert_eq!(batch.len(), 6);
        assert!(src.metrics().iter().any(|(k, _)| k.as_str() == "global.btcDominance"));
    }

    #[tokio::test]
    async fn global_without_data_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;

        let src = build_global(&cfg("coingecko_global", server.uri()), &pool()).unwrap();
        assert!(matches!(src.fetch().await, Err(FetchError::Transient(_))));
    }

    #[tokio::test]
    async fn markets_sends_limit_and_normalizes() {
        let server = MockServer::start().await;
        let body = json_parser::tests::markets_body();
        Mock::given(method("GET"))
            .and(path(MARKETS_PATH))
            .and(query_param("per_page", "3"))
            .and(query_param("vs_currency", "usd"))
            .and(query_param("price_change_percentage", "24h,7d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let mut c = cfg("coingecko_markets", server.uri());
        c.limit = Some(3);
        let batch = build_markets(&c, &pool()).unwrap().fetch().await.unwrap();
        let (key, coins) = &batch[0];
        assert_eq!(key.as_str(), TOP_COINS);
        assert_eq!(coins[0]["symbol"], "btc");
        assert_eq!(coins[0]["marketCapRank"], 1);
    }

    #[tokio::test]
    async fn markets_429_reports_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "5"))
            .mount(&server)
            .await;

        let src = build_markets(&cfg("coingecko_markets", server.uri()), &pool()).unwrap();
        let err = src.fetch().await.unwrap_err();
        assert!(err.is_rate_limit());
        // second attempt is refused locally during the cool-down
        assert!(matches!(src.fetch().await, Err(FetchError::Backoff { .. })));
    }
}
