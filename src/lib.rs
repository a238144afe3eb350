//! Volatility-regime portfolio guardian.
//!
//! Prices for a four-asset universe are fetched from ordered fallback
//! sources, turned into rolling volatility, classified into a calm /
//! turbulent / crash regime against a fixed baseline, and every regime
//! change reallocates the account and appends an audit entry.

pub mod config;
pub mod error;
pub mod guardian;
pub mod logging;
pub mod rebalance;
pub mod regime;
pub mod source;
pub mod storage;
pub mod stress;
pub mod types;
pub mod volatility;
