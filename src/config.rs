use std::time::Duration;

use crate::source::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub sqlite_path: String,
    pub account_id: String,
    pub starting_capital: f64,
    pub vol_window: usize,
    pub baseline_lookback: usize,
    pub history_days: u32,
    pub level2_z: f64,
    pub level3_z: f64,
    /// Share of the risky sleeve that goes to the first risky symbol.
    pub risky_split: f64,
    pub fetch_max_retries: u32,
    pub fetch_base_delay_ms: u64,
    pub fetch_max_delay_ms: u64,
    pub fetch_timeout_secs: u64,
    pub yahoo_base: String,
    pub coingecko_base: String,
    pub stooq_base: String,
    pub stress_baseline_mean: f64,
    pub stress_baseline_std: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./kavach.sqlite".to_string(),
            account_id: "default".to_string(),
            starting_capital: 100_000.0,
            vol_window: 30,
            baseline_lookback: 90,
            history_days: 220,
            level2_z: 2.0,
            level3_z: 3.0,
            risky_split: 0.5,
            fetch_max_retries: 2,
            fetch_base_delay_ms: 250,
            fetch_max_delay_ms: 2_000,
            fetch_timeout_secs: 10,
            yahoo_base: "https://query1.finance.yahoo.com".to_string(),
            coingecko_base: "https://api.coingecko.com".to_string(),
            stooq_base: "https://stooq.com".to_string(),
            stress_baseline_mean: 0.02,
            stress_baseline_std: 0.005,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            account_id: std::env::var("ACCOUNT_ID").unwrap_or(d.account_id),
            starting_capital: std::env::var("STARTING_CAPITAL").ok().and_then(|v| v.parse().ok()).unwrap_or(d.starting_capital),
            vol_window: std::env::var("VOL_WINDOW").ok().and_then(|v| v.parse().ok()).filter(|n| *n > 1).unwrap_or(d.vol_window),
            baseline_lookback: std::env::var("BASELINE_LOOKBACK").ok().and_then(|v| v.parse().ok()).filter(|n| *n > 1).unwrap_or(d.baseline_lookback),
            history_days: std::env::var("HISTORY_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.history_days),
            level2_z: std::env::var("LEVEL2_Z").ok().and_then(|v| v.parse().ok()).unwrap_or(d.level2_z),
            level3_z: std::env::var("LEVEL3_Z").ok().and_then(|v| v.parse().ok()).unwrap_or(d.level3_z),
            risky_split: std::env::var("RISKY_SPLIT").ok().and_then(|v| v.parse().ok()).filter(|s: &f64| (0.0..=1.0).contains(s)).unwrap_or(d.risky_split),
            fetch_max_retries: std::env::var("FETCH_MAX_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(d.fetch_max_retries),
            fetch_base_delay_ms: std::env::var("FETCH_BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.fetch_base_delay_ms),
            fetch_max_delay_ms: std::env::var("FETCH_MAX_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.fetch_max_delay_ms),
            fetch_timeout_secs: std::env::var("FETCH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.fetch_timeout_secs),
            yahoo_base: std::env::var("YAHOO_BASE").unwrap_or(d.yahoo_base),
            coingecko_base: std::env::var("COINGECKO_BASE").unwrap_or(d.coingecko_base),
            stooq_base: std::env::var("STOOQ_BASE").unwrap_or(d.stooq_base),
            stress_baseline_mean: std::env::var("STRESS_BASELINE_MEAN").ok().and_then(|v| v.parse().ok()).unwrap_or(d.stress_baseline_mean),
            stress_baseline_std: std::env::var("STRESS_BASELINE_STD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.stress_baseline_std),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.fetch_max_retries,
            base_delay_ms: self.fetch_base_delay_ms,
            max_delay_ms: self.fetch_max_delay_ms,
            ..RetryPolicy::default()
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}
