use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::error::FetchError;
use crate::source::{get_text, http_client, positive_price, PriceSource};
use crate::types::Asset;

const ID: &str = "yahoo";

/// Yahoo Finance chart API. Primary source for every listed and crypto asset.
pub struct Yahoo {
    client: Client,
    base: String,
}

impl Yahoo {
    pub fn new(cfg: &Config) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client(cfg.fetch_timeout())?,
            base: cfg.yahoo_base.trim_end_matches('/').to_string(),
        })
    }

    async fn chart(&self, asset: &Asset, query: &str) -> Result<Vec<f64>, FetchError> {
        let url = format!("{}/v8/finance/chart/{}?{}", self.base, asset.symbol, query);
        let body = get_text(&self.client, ID, &asset.symbol, &url).await?;
        parse_chart(&body, &asset.symbol)
    }
}

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize, Debug)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize, Debug)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    indicators: Indicators,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

/// Closes from a chart payload, nulls dropped, oldest first.
pub(crate) fn parse_chart(body: &str, symbol: &str) -> Result<Vec<f64>, FetchError> {
    let resp: ChartResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::unavailable(ID, symbol, format!("decode: {}", e)))?;

    if let Some(err) = resp.chart.error {
        let reason = format!("{}: {}", err.code, err.description.unwrap_or_default());
        return if err.code.eq_ignore_ascii_case("not found") {
            Err(FetchError::not_found(ID, symbol, reason))
        } else {
            Err(FetchError::unavailable(ID, symbol, reason))
        };
    }

    let closes: Vec<f64> = resp
        .chart
        .result
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|r| r.indicators.quote.into_iter().next())
        .map(|q| q.close.into_iter().flatten().filter(|c| c.is_finite() && *c > 0.0).collect())
        .unwrap_or_default();

    if closes.is_empty() {
        return Err(FetchError::unavailable(ID, symbol, "no price data in response"));
    }
    Ok(closes)
}

#[async_trait]
impl PriceSource for Yahoo {
    fn id(&self) -> &str {
        ID
    }

    async fn fetch_price(&self, asset: &Asset) -> Result<f64, FetchError> {
        let closes = self.chart(asset, "range=5d&interval=1d").await?;
        let last = closes.last().copied().unwrap_or(0.0);
        positive_price(ID, &asset.symbol, last)
    }

    async fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<f64>, FetchError> {
        let end = Utc::now().timestamp();
        let start = end - i64::from(days) * 86_400;
        let query = format!("period1={}&period2={}&interval=1d", start, end);
        self.chart(asset, &query).await
    }
}
