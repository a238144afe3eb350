//! Market-data source adapters and the fallback provider that drives them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::FetchError;
use crate::types::Asset;

pub mod coingecko;
pub mod fixed;
pub mod provider;
pub mod retry;
pub mod scripted;
pub mod stooq;
pub mod yahoo;

/// A single place prices can come from.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn id(&self) -> &str;

    async fn fetch_price(&self, asset: &Asset) -> Result<f64, FetchError>;

    /// Daily closes, oldest first.
    async fn fetch_history(&self, asset: &Asset, _days: u32) -> Result<Vec<f64>, FetchError> {
        Err(FetchError::unavailable(self.id(), &asset.symbol, "history not supported"))
    }
}

/// Every request through this client is bounded by `timeout`.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("kavach/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// GET `url` and hand back the body, mapping transport and status failures
/// onto the retryable / permanent split.
pub(crate) async fn get_text(client: &Client, source_id: &str, asset: &str, url: &str) -> Result<String, FetchError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_transport(source_id, asset, &e))?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        return Err(classify_status(source_id, asset, status));
    }
    resp.text()
        .await
        .map_err(|e| classify_transport(source_id, asset, &e))
}

pub(crate) fn classify_status(source_id: &str, asset: &str, status: u16) -> FetchError {
    if retry::is_transient_status(status) {
        FetchError::unavailable(source_id, asset, format!("http {}", status))
    } else {
        FetchError::not_found(source_id, asset, format!("http {}", status))
    }
}

pub(crate) fn classify_transport(source_id: &str, asset: &str, err: &reqwest::Error) -> FetchError {
    // Anything on the wire that is not a clear transport fault is still
    // treated as transient; a permanent verdict needs the source to say so.
    let kind = if retry::is_transient_transport(err) { "network" } else { "transport" };
    FetchError::unavailable(source_id, asset, format!("{}: {}", kind, err))
}

pub(crate) fn positive_price(source_id: &str, asset: &str, price: f64) -> Result<f64, FetchError> {
    if price.is_finite() && price > 0.0 {
        Ok(price)
    } else {
        Err(FetchError::unavailable(source_id, asset, format!("bad price {}", price)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_split() {
        assert!(classify_status("s", "A", 503).is_retryable());
        assert!(classify_status("s", "A", 429).is_retryable());
        assert!(classify_status("s", "A", 501).is_retryable());
        assert!(!classify_status("s", "A", 404).is_retryable());
        assert!(!classify_status("s", "A", 400).is_retryable());
    }

    #[test]
    fn rejects_non_positive_prices() {
        assert!(positive_price("s", "A", 0.0).is_err());
        assert!(positive_price("s", "A", f64::NAN).is_err());
        assert_eq!(positive_price("s", "A", 2.5).unwrap(), 2.5);
    }
}
