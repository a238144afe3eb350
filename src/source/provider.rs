//! Resilient multi-source fetcher.
//!
//! Each asset has an ordered list of sources. Every source gets the retry
//! policy's attempts for transient failures; a permanent failure skips straight
//! to the next source. Assets are fetched concurrently and fail independently.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;

use crate::config::Config;
use crate::error::{CycleError, CycleResult, FetchError};
use crate::logging::{log_source_answer, log_source_failure};
use crate::source::coingecko::CoinGecko;
use crate::source::fixed::Fixed;
use crate::source::retry::{retry_async, RetryPolicy};
use crate::source::stooq::Stooq;
use crate::source::yahoo::Yahoo;
use crate::source::PriceSource;
use crate::types::{Asset, MarketKind, MarketObservation, Universe};

/// Ordered sources for one asset, primary first.
#[derive(Clone)]
pub struct AssetRoute {
    pub asset: Asset,
    pub sources: Vec<Arc<dyn PriceSource>>,
}

/// Per-asset outcome of one fetch. Never partially applied by callers.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub observations: BTreeMap<String, MarketObservation>,
    pub failures: BTreeMap<String, FetchError>,
}

impl FetchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// All observations, or `IncompleteUniverse` naming what is missing.
    pub fn into_complete(self) -> CycleResult<BTreeMap<String, MarketObservation>> {
        if self.failures.is_empty() {
            Ok(self.observations)
        } else {
            Err(CycleError::IncompleteUniverse { missing: self.failures })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryReport {
    pub series: BTreeMap<String, Vec<f64>>,
    pub failures: BTreeMap<String, FetchError>,
}

pub struct MarketDataProvider {
    routes: BTreeMap<String, AssetRoute>,
    policy: RetryPolicy,
}

impl MarketDataProvider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { routes: BTreeMap::new(), policy }
    }

    pub fn route(mut self, asset: Asset, sources: Vec<Arc<dyn PriceSource>>) -> Self {
        self.routes
            .insert(asset.symbol.clone(), AssetRoute { asset, sources });
        self
    }

    /// Live routing: Yahoo first everywhere, CoinGecko behind it for crypto,
    /// Stooq behind it for listed assets, a unit price for cash.
    pub fn from_config(cfg: &Config, universe: &Universe) -> reqwest::Result<Self> {
        let yahoo: Arc<dyn PriceSource> = Arc::new(Yahoo::new(cfg)?);
        let coingecko: Arc<dyn PriceSource> = Arc::new(CoinGecko::new(cfg)?);
        let stooq: Arc<dyn PriceSource> = Arc::new(Stooq::new(cfg)?);
        let fixed: Arc<dyn PriceSource> = Arc::new(Fixed::unit());

        let provider = universe.assets().into_iter().fold(Self::new(cfg.retry_policy()), |p, asset| {
            let sources = match asset.kind {
                MarketKind::Crypto => vec![yahoo.clone(), coingecko.clone()],
                MarketKind::Listed => vec![yahoo.clone(), stooq.clone()],
                MarketKind::Fiat => vec![fixed.clone()],
            };
            p.route(asset.clone(), sources)
        });
        Ok(provider)
    }

    /// Current prices for the whole universe.
    pub async fn fetch(&self, universe: &Universe) -> FetchReport {
        self.fetch_symbols(&universe.symbols()).await
    }

    /// Current prices for arbitrary routed symbols; unknown ones fail alone.
    pub async fn fetch_symbols(&self, symbols: &[String]) -> FetchReport {
        let results = join_all(symbols.iter().map(|sym| self.fetch_one(sym))).await;

        let mut report = FetchReport::default();
        for (sym, res) in symbols.iter().zip(results) {
            match res {
                Ok(obs) => {
                    report.observations.insert(sym.clone(), obs);
                }
                Err(e) => {
                    report.failures.insert(sym.clone(), e);
                }
            }
        }
        report
    }

    /// Daily closes for the whole universe, oldest first.
    pub async fn fetch_history(&self, universe: &Universe, days: u32) -> HistoryReport {
        let symbols = universe.symbols();
        let results = join_all(symbols.iter().map(|sym| self.history_one(sym, days))).await;

        let mut report = HistoryReport::default();
        for (sym, res) in symbols.into_iter().zip(results) {
            match res {
                Ok(series) => {
                    report.series.insert(sym, series);
                }
                Err(e) => {
                    report.failures.insert(sym, e);
                }
            }
        }
        report
    }

    async fn fetch_one(&self, symbol: &str) -> Result<MarketObservation, FetchError> {
        let route = self.route_for(symbol)?;
        let (price, source_id) = self
            .walk_sources(route, "price", |src, asset| async move {
                src.fetch_price(&asset).await
            })
            .await?;
        Ok(MarketObservation {
            asset_id: symbol.to_string(),
            price,
            timestamp: Utc::now(),
            source_id,
        })
    }

    async fn history_one(&self, symbol: &str, days: u32) -> Result<Vec<f64>, FetchError> {
        let route = self.route_for(symbol)?;
        let (series, _) = self
            .walk_sources(route, "history", move |src, asset| async move {
                src.fetch_history(&asset, days).await
            })
            .await?;
        Ok(series)
    }

    fn route_for(&self, symbol: &str) -> Result<&AssetRoute, FetchError> {
        self.routes.get(symbol).ok_or_else(|| FetchError::Exhausted {
            asset: symbol.to_string(),
            attempts: vec!["no sources configured".to_string()],
        })
    }

    /// The single retry-and-fallback loop every asset class goes through.
    /// Stops at the first source that answers.
    async fn walk_sources<T, F, Fut>(
        &self,
        route: &AssetRoute,
        what: &str,
        call: F,
    ) -> Result<(T, String), FetchError>
    where
        F: Fn(Arc<dyn PriceSource>, Asset) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let symbol = &route.asset.symbol;
        let mut attempts = Vec::new();

        for (depth, src) in route.sources.iter().enumerate() {
            let op_name = format!("{}:{}:{}", src.id(), what, symbol);
            let outcome = retry_async(&self.policy, &op_name, FetchError::is_retryable, || {
                call(src.clone(), route.asset.clone())
            })
            .await;

            match outcome {
                Ok(value) => {
                    log_source_answer(symbol, src.id(), what, depth);
                    return Ok((value, src.id().to_string()));
                }
                Err(e) => {
                    log_source_failure(symbol, src.id(), &e.to_string(), !e.is_retryable());
                    attempts.push(e.to_string());
                }
            }
        }

        Err(FetchError::Exhausted { asset: symbol.clone(), attempts })
    }
}
