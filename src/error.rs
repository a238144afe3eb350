//! Error taxonomy for the decision pipeline.
//!
//! Fetch errors stay inside the provider's retry loop unless every source for
//! an asset is exhausted. Cycle errors are what callers of the invocation
//! surface see.

use std::collections::BTreeMap;

use thiserror::Error;

/// Outcome of a single source attempt for a single asset.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Transient: timeouts, connection failures, throttling, 5xx, bad payloads.
    #[error("{source_id} unavailable for {asset}: {reason}")]
    SourceUnavailable {
        source_id: String,
        asset: String,
        reason: String,
    },
    /// Permanent for this source: the source does not know the asset.
    #[error("{source_id} has no data for {asset}: {reason}")]
    AssetNotFound {
        source_id: String,
        asset: String,
        reason: String,
    },
    /// Every configured source failed for the asset.
    #[error("all sources exhausted for {asset}: {}", .attempts.join(" | "))]
    Exhausted { asset: String, attempts: Vec<String> },
}

impl FetchError {
    pub fn unavailable(source_id: &str, asset: &str, reason: impl Into<String>) -> Self {
        FetchError::SourceUnavailable {
            source_id: source_id.to_string(),
            asset: asset.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(source_id: &str, asset: &str, reason: impl Into<String>) -> Self {
        FetchError::AssetNotFound {
            source_id: source_id.to_string(),
            asset: asset.to_string(),
            reason: reason.into(),
        }
    }

    /// Only transient failures are worth another attempt on the same source.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::SourceUnavailable { .. })
    }
}

/// Persistence collaborator failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("bad timestamp '{0}'")]
    Timestamp(String),
    #[error("account {account_id} changed concurrently (expected version {expected})")]
    VersionConflict { account_id: String, expected: u64 },
    #[error("store poisoned")]
    Poisoned,
}

/// User-visible failures of check / deploy / stress operations.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to fetch regime data: missing {}", .missing.keys().cloned().collect::<Vec<_>>().join(", "))]
    IncompleteUniverse { missing: BTreeMap<String, FetchError> },
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("account {0} is not deployed")]
    NotDeployed(String),
    #[error("account {0} has no capital to deploy")]
    NoCapital(String),
}

pub type CycleResult<T> = Result<T, CycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(FetchError::unavailable("yahoo", "BTC-USD", "timeout").is_retryable());
        assert!(!FetchError::not_found("stooq", "BTC-USD", "N/D").is_retryable());
        let exhausted = FetchError::Exhausted {
            asset: "GLD".into(),
            attempts: vec!["a".into()],
        };
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn incomplete_universe_names_missing_assets() {
        let mut missing = BTreeMap::new();
        missing.insert(
            "GLD".to_string(),
            FetchError::Exhausted { asset: "GLD".into(), attempts: vec![] },
        );
        let msg = CycleError::IncompleteUniverse { missing }.to_string();
        assert!(msg.starts_with("failed to fetch regime data"));
        assert!(msg.contains("GLD"));
    }
}
