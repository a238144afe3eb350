//! In-process source with scripted answers, for dry runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::source::PriceSource;
use crate::types::Asset;

#[derive(Default)]
struct Script {
    steady: HashMap<String, Result<f64, FetchError>>,
    queued: HashMap<String, VecDeque<Result<f64, FetchError>>>,
    history: HashMap<String, Vec<f64>>,
    calls: HashMap<String, u32>,
}

/// Answers from a script: queued responses first, then the steady one.
/// Symbols with no script answer `AssetNotFound`.
pub struct Scripted {
    id: String,
    script: Mutex<Script>,
}

impl Scripted {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string(), script: Mutex::new(Script::default()) }
    }

    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn with_failure(self, symbol: &str, err: FetchError) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.steady.insert(symbol.to_string(), Err(err));
        }
        self
    }

    pub fn with_history(self, symbol: &str, closes: Vec<f64>) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.history.insert(symbol.to_string(), closes);
        }
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        if let Ok(mut s) = self.script.lock() {
            s.steady.insert(symbol.to_string(), Ok(price));
        }
    }

    /// Answer once with `response` before falling back to the steady script.
    pub fn push(&self, symbol: &str, response: Result<f64, FetchError>) {
        if let Ok(mut s) = self.script.lock() {
            s.queued.entry(symbol.to_string()).or_default().push_back(response);
        }
    }

    pub fn calls(&self, symbol: &str) -> u32 {
        self.script
            .lock()
            .map(|s| s.calls.get(symbol).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl PriceSource for Scripted {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_price(&self, asset: &Asset) -> Result<f64, FetchError> {
        let mut s = self
            .script
            .lock()
            .map_err(|_| FetchError::unavailable(&self.id, &asset.symbol, "script poisoned"))?;
        *s.calls.entry(asset.symbol.clone()).or_insert(0) += 1;
        if let Some(next) = s.queued.get_mut(&asset.symbol).and_then(|q| q.pop_front()) {
            return next;
        }
        s.steady
            .get(&asset.symbol)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::not_found(&self.id, &asset.symbol, "unscripted")))
    }

    async fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<f64>, FetchError> {
        let s = self
            .script
            .lock()
            .map_err(|_| FetchError::unavailable(&self.id, &asset.symbol, "script poisoned"))?;
        match s.history.get(&asset.symbol) {
            Some(closes) => {
                let keep = closes.len().min(days as usize);
                Ok(closes[closes.len() - keep..].to_vec())
            }
            None => Err(FetchError::unavailable(&self.id, &asset.symbol, "no scripted history")),
        }
    }
}
