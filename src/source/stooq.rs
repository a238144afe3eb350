use async_trait::async_trait;
use reqwest::Client;

use crate::config::Config;
use crate::error::FetchError;
use crate::source::{get_text, http_client, positive_price, PriceSource};
use crate::types::Asset;

const ID: &str = "stooq";

/// Stooq CSV quotes. Fallback for listed equities and commodities.
pub struct Stooq {
    client: Client,
    base: String,
}

impl Stooq {
    pub fn new(cfg: &Config) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client(cfg.fetch_timeout())?,
            base: cfg.stooq_base.trim_end_matches('/').to_string(),
        })
    }

    /// US listings live under a `.us` suffix.
    fn ticker(asset: &Asset) -> String {
        format!("{}.us", asset.symbol.to_lowercase())
    }
}

/// Index of the `Close` column in a Stooq CSV header.
fn close_column(header: &str) -> Option<usize> {
    header
        .split(',')
        .position(|c| c.trim().eq_ignore_ascii_case("close"))
}

fn parse_field(raw: &str, symbol: &str) -> Result<f64, FetchError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("N/D") {
        return Err(FetchError::not_found(ID, symbol, "N/D"));
    }
    raw.parse::<f64>()
        .map_err(|_| FetchError::unavailable(ID, symbol, format!("bad close '{}'", raw)))
}

/// Closes from a Stooq CSV body (quote or daily history), oldest first.
pub(crate) fn parse_csv(body: &str, symbol: &str) -> Result<Vec<f64>, FetchError> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| FetchError::unavailable(ID, symbol, "empty response"))?;
    if header.eq_ignore_ascii_case("no data") {
        return Err(FetchError::not_found(ID, symbol, "no data"));
    }
    let col = close_column(header)
        .ok_or_else(|| FetchError::unavailable(ID, symbol, "missing Close column"))?;

    let mut closes = Vec::new();
    for line in lines {
        let field = line
            .split(',')
            .nth(col)
            .ok_or_else(|| FetchError::unavailable(ID, symbol, "short row"))?;
        closes.push(positive_price(ID, symbol, parse_field(field, symbol)?)?);
    }
    if closes.is_empty() {
        return Err(FetchError::unavailable(ID, symbol, "no rows"));
    }
    Ok(closes)
}

#[async_trait]
impl PriceSource for Stooq {
    fn id(&self) -> &str {
        ID
    }

    async fn fetch_price(&self, asset: &Asset) -> Result<f64, FetchError> {
        let url = format!("{}/q/l/?s={}&f=sd2t2ohlcv&h&e=csv", self.base, Self::ticker(asset));
        let body = get_text(&self.client, ID, &asset.symbol, &url).await?;
        let closes = parse_csv(&body, &asset.symbol)?;
        positive_price(ID, &asset.symbol, closes.last().copied().unwrap_or(0.0))
    }

    async fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<f64>, FetchError> {
        let url = format!("{}/q/d/l/?s={}&i=d", self.base, Self::ticker(asset));
        let body = get_text(&self.client, ID, &asset.symbol, &url).await?;
        let closes = parse_csv(&body, &asset.symbol)?;
        let keep = closes.len().min(days as usize);
        Ok(closes[closes.len() - keep..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_reads_close_not_open() {
        let body = "Symbol,Date,Time,Open,High,Low,Close,Volume\nGLD.US,2024-05-01,22:00:00,210.1,212.0,209.5,211.7,1000\n";
        assert_eq!(parse_csv(body, "GLD").unwrap(), vec![211.7]);
    }

    #[test]
    fn history_rows_in_order() {
        let body = "Date,Open,High,Low,Close,Volume\n2024-05-01,1,1,1,10.0,5\n2024-05-02,1,1,1,11.0,5\n";
        assert_eq!(parse_csv(body, "GLD").unwrap(), vec![10.0, 11.0]);
    }

    #[test]
    fn nd_is_permanent() {
        let body = "Symbol,Date,Time,Open,High,Low,Close,Volume\nXYZ.US,N/D,N/D,N/D,N/D,N/D,N/D,N/D\n";
        assert!(matches!(parse_csv(body, "XYZ"), Err(FetchError::AssetNotFound { .. })));
        assert!(matches!(parse_csv("No data", "XYZ"), Err(FetchError::AssetNotFound { .. })));
    }

    #[test]
    fn ticker_suffix() {
        use crate::types::{AssetClass, MarketKind};
        let gld = Asset::new("GLD", AssetClass::Safe, MarketKind::Listed);
        assert_eq!(Stooq::ticker(&gld), "gld.us");
    }
}
