use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::error::FetchError;
use crate::source::{get_text, http_client, positive_price, PriceSource};
use crate::types::Asset;

const ID: &str = "coingecko";

/// CoinGecko public API. Crypto fallback.
pub struct CoinGecko {
    client: Client,
    base: String,
    coin_ids: HashMap<String, String>,
}

impl CoinGecko {
    pub fn new(cfg: &Config) -> reqwest::Result<Self> {
        let coin_ids = [("BTC-USD", "bitcoin"), ("ETH-USD", "ethereum")]
            .iter()
            .map(|(s, id)| (s.to_string(), id.to_string()))
            .collect();
        Ok(Self {
            client: http_client(cfg.fetch_timeout())?,
            base: cfg.coingecko_base.trim_end_matches('/').to_string(),
            coin_ids,
        })
    }

    fn coin_id(&self, asset: &Asset) -> Result<&str, FetchError> {
        self.coin_ids
            .get(&asset.symbol)
            .map(String::as_str)
            .ok_or_else(|| FetchError::not_found(ID, &asset.symbol, "coin not mapped"))
    }
}

#[derive(Deserialize, Debug)]
struct UsdPrice {
    usd: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct MarketChart {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

pub(crate) fn parse_simple_price(body: &str, coin_id: &str, symbol: &str) -> Result<f64, FetchError> {
    let data: HashMap<String, UsdPrice> = serde_json::from_str(body)
        .map_err(|e| FetchError::unavailable(ID, symbol, format!("decode: {}", e)))?;
    let price = data
        .get(coin_id)
        .and_then(|p| p.usd)
        .ok_or_else(|| FetchError::not_found(ID, symbol, "coin id not in response"))?;
    positive_price(ID, symbol, price)
}

/// Daily closes from a market chart: last sample of each UTC day.
pub(crate) fn parse_market_chart(body: &str, symbol: &str) -> Result<Vec<f64>, FetchError> {
    let chart: MarketChart = serde_json::from_str(body)
        .map_err(|e| FetchError::unavailable(ID, symbol, format!("decode: {}", e)))?;

    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (ts_ms, price) in chart.prices {
        if !(price.is_finite() && price > 0.0) {
            continue;
        }
        if let Some(dt) = Utc.timestamp_millis_opt(ts_ms as i64).single() {
            by_day.insert(dt.date_naive(), price);
        }
    }
    if by_day.is_empty() {
        return Err(FetchError::unavailable(ID, symbol, "no prices in response"));
    }
    Ok(by_day.into_values().collect())
}

#[async_trait]
impl PriceSource for CoinGecko {
    fn id(&self) -> &str {
        ID
    }

    async fn fetch_price(&self, asset: &Asset) -> Result<f64, FetchError> {
        let coin_id = self.coin_id(asset)?;
        let url = format!("{}/api/v3/simple/price?ids={}&vs_currencies=usd", self.base, coin_id);
        let body = get_text(&self.client, ID, &asset.symbol, &url).await?;
        parse_simple_price(&body, coin_id, &asset.symbol)
    }

    async fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<f64>, FetchError> {
        let coin_id = self.coin_id(asset)?;
        let url = format!(
            "{}/api/v3/coins/{}/market_chart?vs_currency=usd&days={}",
            self.base, coin_id, days
        );
        let body = get_text(&self.client, ID, &asset.symbol, &url).await?;
        parse_market_chart(&body, &asset.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetClass, MarketKind};

    #[test]
    fn simple_price() {
        let body = r#"{"bitcoin":{"usd":64250.5}}"#;
        assert_eq!(parse_simple_price(body, "bitcoin", "BTC-USD").unwrap(), 64250.5);
    }

    #[test]
    fn missing_coin_is_permanent() {
        let err = parse_simple_price("{}", "bitcoin", "BTC-USD").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn market_chart_keeps_last_sample_per_day() {
        // 2024-01-01 00:00, 2024-01-01 12:00, 2024-01-02 00:00 (ms)
        let body = r#"{"prices":[[1704067200000,100.0],[1704110400000,105.0],[1704153600000,110.0]]}"#;
        assert_eq!(parse_market_chart(body, "BTC-USD").unwrap(), vec![105.0, 110.0]);
    }

    #[test]
    fn unmapped_symbol_is_not_found() {
        let cg = CoinGecko::new(&Config::default()).unwrap();
        let gld = Asset::new("GLD", AssetClass::Safe, MarketKind::Listed);
        assert!(matches!(cg.coin_id(&gld), Err(FetchError::AssetNotFound { .. })));
    }
}
