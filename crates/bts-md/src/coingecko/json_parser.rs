//! CoinGecko response parsers.

use serde_json::{Map, Value, json};

use crate::json_util::{f64_at, parse_f64_field, parse_str_u64};
use crate::source::MetricBatch;

/// One scalar read from the `/global` response.
pub struct GlobalField {
    pub key: &'static str,
    pub pointer: &'static str,
    /// May be zero or negative.
    pub signed: bool,
}

impl GlobalField {
    const fn unsigned(key: &'static str, pointer: &'static str) -> Self {
        Self {
            key,
            pointer,
            signed: false,
        }
    }
}

pub const GLOBAL_FIELDS: [GlobalField; 6] = [
    GlobalField::unsigned("global.totalMarketCapUsd", "/data/total_market_cap/usd"),
    GlobalField::unsigned("global.totalVolumeUsd", "/data/total_volume/usd"),
    GlobalField::unsigned("global.btcDominance", "/data/market_cap_percentage/btc"),
    GlobalField::unsigned("global.ethDominance", "/data/market_cap_percentage/eth"),
    GlobalField {
        key: "global.marketCapChange24h",
        pointer: "/data/market_cap_change_percentage_24h_usd",
        signed: true,
    },
    GlobalField::unsigned("global.activeCryptocurrencies", "/data/active_cryptocurrencies"),
];

/// Every aggregate present in the response, as `{"value": ...}` payloads.
/// Missing fields are skipped; the store keeps their previous values.
pub fn parse_global(body: &Value) -> MetricBatch {
    GLOBAL_FIELDS
        .iter()
        .filter_map(|f| f64_at(body, f.pointer).map(|v| (f.key.into(), json!({"value": v}))))
        .collect()
}

/// Normalize a `/coins/markets` array. Entries without an id are dropped.
pub fn parse_markets(body: &Value) -> Option<Vec<Value>> {
    let items = body.as_array()?;
    Some(items.iter().filter_map(parse_coin).collect())
}

fn parse_coin(item: &Value) -> Option<Value> {
    let id = item.get("id")?.as_str()?;
    let text = |field: &str| {
        item.get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let sparkline: Vec<f64> = item
        .pointer("/sparkline_in_7d/price")
        .and_then(Value::as_array)
        .map(|prices| prices.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();

    let mut coin = Map::new();
    coin.insert("id".into(), id.into());
    coin.insert("symbol".into(), text("symbol").into());
    coin.insert("name".into(), text("name").into());
    coin.insert("currentPrice".into(), parse_f64_field(item, "current_price").into());
    coin.insert("marketCap".into(), parse_f64_field(item, "market_cap").into());
    coin.insert("marketCapRank".into(), parse_str_u64(item.get("market_cap_rank")).into());
    coin.insert(
        "priceChange24h".into(),
        parse_f64_field(item, "price_change_percentage_24h_in_currency")
            .or_else(|| parse_f64_field(item, "price_change_percentage_24h"))
            .into(),
    );
    coin.insert(
        "priceChange7d".into(),
        parse_f64_field(item, "price_change_percentage_7d_in_currency").into(),
    );
    coin.insert("sparkline7d".into(), sparkline.into());
    Some(Value::Object(coin))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn global_body() -> Value {
        json!({"data": {
            "active_cryptocurrencies": 17_000,
            "total_market_cap": {"usd": 3.1e12, "eur": 2.9e12},
            "total_volume": {"usd": 1.2e11},
            "market_cap_percentage": {"btc": 57.08, "eth": 11.9},
            "market_cap_change_percentage_24h_usd": -1.25
        }})
    }

    pub(crate) fn markets_body() -> Value {
        json!([
            {
                "id": "bitcoin", "symbol": "btc", "name": "Bitcoin",
                "current_price": 98000.5, "market_cap": 1.9e12, "market_cap_rank": 1,
                "price_change_percentage_24h": 1.1,
                "price_change_percentage_24h_in_currency": 1.2,
                "price_change_percentage_7d_in_currency": -3.4,
                "sparkline_in_7d": {"price": [97000.0, 97500.0, 98000.5]}
            },
            {
                "id": "ethereum", "symbol": "eth", "name": "Ethereum",
                "current_price": 3500.0, "market_cap": 4.2e11, "market_cap_rank": 2,
                "price_change_percentage_24h": 0.5
            },
            {"symbol": "???"}
        ])
    }

    #[test]
    fn global_fields() {
        let batch = parse_global(&global_body());
        let get = |k: &str| {
            batch
                .iter()
                .find(|(key, _)| key.as_str() == k)
                .map(|(_, v)| v["value"].clone())
        };
        assert_eq!(get("global.btcDominance").unwrap(), 57.08);
        assert_eq!(get("global.marketCapChange24h").unwrap(), -1.25);
        assert_eq!(get("global.activeCryptocurrencies").unwrap(), 17_000.0);
    }

    #[test]
    fn global_partial() {
        let batch = parse_global(&json!({"data": {"market_cap_percentage": {"btc": 57.0}}}));
        assert_eq!(batch.len(), 1);
        assert!(parse_global(&json!({})).is_empty());
    }

    #[test]
    fn markets_normalized() {
        let coins = parse_markets(&markets_body()).unwrap();
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[0]["currentPrice"], 98000.5);
        assert_eq!(coins[0]["priceChange24h"], 1.2);
        assert_eq!(coins[0]["priceChange7d"], -3.4);
        assert_eq!(coins[0]["sparkline7d"].as_array().unwrap().len(), 3);
        // 24h falls back to the plain field; 7d absent is null
        assert_eq!(coins[1]["priceChange24h"], 0.5);
        assert!(coins[1]["priceChange7d"].is_null());
        assert_eq!(coins[1]["sparkline7d"], json!([]));
    }

    #[test]
    fn markets_not_an_array() {
        assert!(parse_markets(&json!({"error": "rate limited"})).is_none());
    }
}
