//! Domain records shared by the pipeline stages.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk role of an asset inside the allocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Risky,
    Safe,
    Cash,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Risky => "risky",
            AssetClass::Safe => "safe",
            AssetClass::Cash => "cash",
        }
    }
}

/// Where an asset trades; decides which fallback sources apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Crypto,
    Listed,
    Fiat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub class: AssetClass,
    pub kind: MarketKind,
}

impl Asset {
    pub fn new(symbol: &str, class: AssetClass, kind: MarketKind) -> Self {
        Self { symbol: symbol.to_string(), class, kind }
    }
}

/// The fixed four-symbol universe: two risky, one safe haven, one cash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Universe {
    pub risky: [Asset; 2],
    pub safe: Asset,
    pub cash: Asset,
}

impl Default for Universe {
    fn default() -> Self {
        Self {
            risky: [
                Asset::new("BTC-USD", AssetClass::Risky, MarketKind::Crypto),
                Asset::new("ETH-USD", AssetClass::Risky, MarketKind::Crypto),
            ],
            safe: Asset::new("GLD", AssetClass::Safe, MarketKind::Listed),
            cash: Asset::new("USD", AssetClass::Cash, MarketKind::Fiat),
        }
    }
}

impl Universe {
    pub fn assets(&self) -> Vec<&Asset> {
        vec![&self.risky[0], &self.risky[1], &self.safe, &self.cash]
    }

    pub fn symbols(&self) -> Vec<String> {
        self.assets().iter().map(|a| a.symbol.clone()).collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.assets().iter().any(|a| a.symbol == symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketObservation {
    pub asset_id: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
}

/// Discrete market-risk classification. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Calm,
    Turbulent,
    Crash,
}

impl Regime {
    pub fn level(&self) -> u8 {
        match self {
            Regime::Calm => 1,
            Regime::Turbulent => 2,
            Regime::Crash => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Regime::Calm => "calm",
            Regime::Turbulent => "turbulent",
            Regime::Crash => "crash",
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Regime::Calm),
            2 => Some(Regime::Turbulent),
            3 => Some(Regime::Crash),
            _ => None,
        }
    }

    /// Target fractions of portfolio value: (risky, safe, cash).
    pub fn target_weights(&self) -> TargetWeights {
        match self {
            Regime::Calm => TargetWeights { risky: 0.80, safe: 0.15, cash: 0.05 },
            Regime::Turbulent => TargetWeights { risky: 0.40, safe: 0.50, cash: 0.10 },
            Regime::Crash => TargetWeights { risky: 0.0, safe: 0.0, cash: 1.0 },
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetWeights {
    pub risky: f64,
    pub safe: f64,
    pub cash: f64,
}

impl fmt::Display for TargetWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "risky {:.0}% / safe {:.0}% / cash {:.0}%",
            self.risky * 100.0,
            self.safe * 100.0,
            self.cash * 100.0
        )
    }
}

/// How a regime state was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    ZScore,
    /// Degenerate input (empty window, flat baseline) forced the calm default.
    Fallback,
    StressTest,
}

impl DetectedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectedBy::ZScore => "z_score",
            DetectedBy::Fallback => "fallback",
            DetectedBy::StressTest => "stress_test",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "z_score" => DetectedBy::ZScore,
            "stress_test" => DetectedBy::StressTest,
            _ => DetectedBy::Fallback,
        }
    }
}

/// Latest detection for an account. `regime` is the only source of level and
/// name, so neither can drift from the classified z-score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub z_score: f64,
    pub current_vol: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    pub detected_by: DetectedBy,
    pub as_of: DateTime<Utc>,
}

impl RegimeState {
    pub fn level(&self) -> u8 {
        self.regime.level()
    }

    pub fn regime_name(&self) -> &'static str {
        self.regime.name()
    }
}

/// One line of an allocation: dollars, the units they bought and at what price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub dollars: f64,
    pub units: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAllocation {
    pub portfolio_value: f64,
    pub allocation: BTreeMap<String, Position>,
    pub as_of: DateTime<Utc>,
}

impl PortfolioAllocation {
    pub fn dollars(&self, symbol: &str) -> f64 {
        self.allocation.get(symbol).map(|p| p.dollars).unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.allocation.values().map(|p| p.dollars).sum()
    }

    /// Value held units at `marks`; symbols without a mark keep their last price.
    pub fn mark_to_market(&self, marks: &BTreeMap<String, f64>) -> f64 {
        self.allocation
            .iter()
            .map(|(sym, pos)| pos.units * marks.get(sym).copied().unwrap_or(pos.price))
            .sum()
    }

    /// Prices the allocation was struck at.
    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.allocation.iter().map(|(s, p)| (s.clone(), p.price)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceAction {
    CapitalDeployment,
    Rebalance,
}

impl RebalanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceAction::CapitalDeployment => "capital_deployment",
            RebalanceAction::Rebalance => "rebalance",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "capital_deployment" => RebalanceAction::CapitalDeployment,
            _ => RebalanceAction::Rebalance,
        }
    }
}

/// Audit log entry. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub timestamp: DateTime<Utc>,
    pub action: RebalanceAction,
    /// `None` for the first allocation out of the undeployed state.
    pub previous_regime: Option<Regime>,
    pub new_regime: Regime,
    pub z_score: f64,
    pub allocation_snapshot: BTreeMap<String, f64>,
    pub portfolio_value_before: f64,
    pub portfolio_value_after: f64,
    pub reasoning: String,
    /// sha256 over the previous digest and this entry's content.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub account_id: String,
    pub deployed: bool,
    pub starting_capital: f64,
    pub portfolio_value: f64,
    /// Regime of the last allocation; what transitions compare against.
    pub last_regime: Option<Regime>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl AccountState {
    pub fn open(account_id: &str, starting_capital: f64) -> Self {
        Self {
            account_id: account_id.to_string(),
            deployed: false,
            starting_capital,
            portfolio_value: starting_capital,
            last_regime: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// One row of detection history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub timestamp: DateTime<Utc>,
    pub regime: Regime,
    pub z_score: f64,
    pub current_vol: f64,
    pub detected_by: DetectedBy,
}

impl From<&RegimeState> for RegimeSnapshot {
    fn from(s: &RegimeState) -> Self {
        Self {
            timestamp: s.as_of,
            regime: s.regime,
            z_score: s.z_score,
            current_vol: s.current_vol,
            detected_by: s.detected_by,
        }
    }
}
