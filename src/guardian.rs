//! Per-account decision cycles: fetch → volatility → regime → rebalance.
//!
//! Every cycle for an account runs under that account's async lock, held
//! across the network fetch and the commit. Market memory is worked on as a
//! copy and only replaces the live one once persistence succeeded, so a
//! failed cycle leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::config::Config;
use crate::error::{CycleError, CycleResult, StoreError};
use crate::logging::{log, log_cycle_failure, log_regime, obj, v_num, v_str, Domain, Level};
use crate::rebalance::{AllocationPolicy, RebalancingEngine};
use crate::regime::{Baseline, RegimeDetector, Thresholds};
use crate::source::provider::{FetchReport, MarketDataProvider};
use crate::storage::Persistence;
use crate::stress::StressTestHarness;
use crate::types::{
    AccountState, AssetClass, PortfolioAllocation, RebalanceEvent, RegimeSnapshot, RegimeState, Universe,
};
use crate::volatility::{class_return, simple_returns, VolatilityTracker};

/// What an invocation hands back: the detection and, if one fired, the event.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub regime: RegimeState,
    pub event: Option<RebalanceEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub account: AccountState,
    pub regime: Option<RegimeState>,
    pub allocation: Option<PortfolioAllocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditView {
    pub events: Vec<RebalanceEvent>,
    pub regimes: Vec<RegimeSnapshot>,
}

/// Rolling windows plus the prices the next returns are measured from.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketMemory {
    pub tracker: VolatilityTracker,
    pub last_prices: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Check,
    Deploy,
}

pub struct Guardian<S: Persistence> {
    cfg: Config,
    universe: Universe,
    provider: MarketDataProvider,
    detector: RegimeDetector,
    engine: RebalancingEngine,
    stress: StressTestHarness,
    /// Template for accounts that have not polled yet.
    seed: MarketMemory,
    memories: Mutex<HashMap<String, MarketMemory>>,
    store: Mutex<S>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: Persistence> Guardian<S> {
    pub fn new(cfg: Config, universe: Universe, provider: MarketDataProvider, store: S) -> Self {
        let thresholds = Thresholds { turbulent: cfg.level2_z, crash: cfg.level3_z };
        let engine = RebalancingEngine::new(AllocationPolicy::new(universe.clone(), cfg.risky_split));
        let stress = StressTestHarness::new(Baseline::new(cfg.stress_baseline_mean, cfg.stress_baseline_std));
        Self {
            seed: MarketMemory {
                tracker: VolatilityTracker::new(cfg.vol_window),
                last_prices: BTreeMap::new(),
            },
            detector: RegimeDetector::new(thresholds),
            engine,
            stress,
            provider,
            universe,
            cfg,
            memories: Mutex::new(HashMap::new()),
            store: Mutex::new(store),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    /// Fix the driving class's baseline by hand instead of from history.
    pub fn set_baseline(&mut self, baseline: Baseline) {
        let driver = self.detector.driver();
        self.detector.set_baseline(driver, baseline);
    }

    /// Seed windows, baselines and reference prices from daily history.
    /// Classes whose history could not be fetched stay empty and detect calm
    /// until enough live polls accumulate.
    pub async fn bootstrap(&mut self) -> Option<Baseline> {
        let report = self.provider.fetch_history(&self.universe, self.cfg.history_days).await;
        for (symbol, err) in &report.failures {
            log(
                Level::Warn,
                Domain::System,
                "history_missing",
                obj(&[("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
            );
        }

        let mut by_class: BTreeMap<AssetClass, Vec<Vec<f64>>> = BTreeMap::new();
        for asset in self.universe.assets() {
            let Some(closes) = report.series.get(&asset.symbol) else { continue };
            if let Some(last) = closes.last() {
                self.seed.last_prices.insert(asset.symbol.clone(), *last);
            }
            if asset.class != AssetClass::Cash {
                by_class.entry(asset.class).or_default().push(simple_returns(closes));
            }
        }

        for (class, members) in by_class {
            let series = equal_weight(&members);
            self.seed.tracker.seed(class, &series);
            if let Some(b) = Baseline::from_returns(&series, self.cfg.vol_window, self.cfg.baseline_lookback) {
                self.detector.set_baseline(class, b);
            }
        }

        let baseline = self.detector.baseline(self.detector.driver());
        log(
            Level::Info,
            Domain::System,
            "bootstrap",
            obj(&[
                ("symbols", v_num(report.series.len() as f64)),
                ("baseline_mean", baseline.map(|b| v_num(b.mean)).unwrap_or_default()),
                ("baseline_std", baseline.map(|b| v_num(b.std)).unwrap_or_default()),
            ]),
        );
        baseline
    }

    /// Create the account record if it does not exist yet.
    pub fn open_account(&self, account_id: &str, starting_capital: f64) -> CycleResult<AccountState> {
        let mut store = self.store()?;
        if let Some(existing) = store.load_account_state(account_id)? {
            return Ok(existing);
        }
        let account = AccountState::open(account_id, starting_capital);
        store.save_account_state(&account)?;
        Ok(account)
    }

    /// Poll: detect, and rebalance if a deployed account changed regime.
    /// An undeployed account only gets its regime state recorded.
    pub async fn check_regime(&self, account_id: &str) -> CycleResult<CycleOutcome> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;
        let res = self.run_cycle(account_id, Mode::Check).await;
        report("check_regime", account_id, res)
    }

    /// First allocation at the current regime. Already deployed accounts get
    /// their stored state back untouched.
    pub async fn deploy(&self, account_id: &str) -> CycleResult<CycleOutcome> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let stored = {
            let store = self.store()?;
            match store.load_account_state(account_id)? {
                Some(a) if a.deployed => store.load_regime_state(account_id)?,
                _ => None,
            }
        };
        if let Some(regime) = stored {
            return Ok(CycleOutcome { regime, event: None });
        }

        let res = self.run_cycle(account_id, Mode::Deploy).await;
        report("deploy", account_id, res)
    }

    /// Synthetic crash through the live detector and engine.
    pub async fn stress_test(&self, account_id: &str) -> CycleResult<CycleOutcome> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let res = self.stress_cycle(account_id);
        if let Ok(out) = &res {
            log_regime(account_id, &out.regime);
        }
        report("stress_test", account_id, res)
    }

    /// Current prices with per-symbol failures; nothing is recorded.
    pub async fn quote(&self, symbols: &[String]) -> FetchReport {
        self.provider.fetch_symbols(symbols).await
    }

    pub fn status(&self, account_id: &str) -> CycleResult<Option<AccountView>> {
        let store = self.store()?;
        let Some(account) = store.load_account_state(account_id)? else {
            return Ok(None);
        };
        Ok(Some(AccountView {
            regime: store.load_regime_state(account_id)?,
            allocation: store.load_allocation(account_id)?,
            account,
        }))
    }

    /// Audit trail (oldest first) and the newest `limit` detections.
    pub fn history(&self, account_id: &str, limit: usize) -> CycleResult<AuditView> {
        let store = self.store()?;
        Ok(AuditView {
            events: store.list_rebalance_events(account_id)?,
            regimes: store.list_regime_history(account_id, limit)?,
        })
    }

    /// Read-only access to the persistence collaborator.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> CycleResult<R> {
        let store = self.store()?;
        Ok(f(&store))
    }

    fn stress_cycle(&self, account_id: &str) -> CycleResult<CycleOutcome> {
        let memory = self.memory_for(account_id);
        let mut store = self.store()?;
        let account = store
            .load_account_state(account_id)?
            .ok_or_else(|| CycleError::NotDeployed(account_id.to_string()))?;
        let out = self.stress.inject_crash(
            &self.detector,
            &memory.tracker,
            &self.engine,
            &mut *store,
            &account,
            &memory.last_prices,
        )?;
        Ok(CycleOutcome { regime: out.regime, event: out.event })
    }

    async fn run_cycle(&self, account_id: &str, mode: Mode) -> CycleResult<CycleOutcome> {
        let account = {
            let store = self.store()?;
            store.load_account_state(account_id)?
        }
        .unwrap_or_else(|| AccountState::open(account_id, self.cfg.starting_capital));

        // nothing below runs unless every asset resolved
        let observations = self.provider.fetch(&self.universe).await.into_complete()?;
        let prices: BTreeMap<String, f64> =
            observations.iter().map(|(s, o)| (s.clone(), o.price)).collect();

        let mut memory = self.memory_for(account_id);
        let returns = self.class_returns(&memory.last_prices, &prices);
        let regime = self.detector.observe(&mut memory.tracker, &returns);
        memory.last_prices = prices.clone();

        let event = {
            let mut store = self.store()?;
            if account.deployed || mode == Mode::Deploy {
                let mut account = account.clone();
                if account.deployed {
                    if let Some(held) = store.load_allocation(account_id)? {
                        account.portfolio_value = held.mark_to_market(&prices);
                    }
                }
                let event = self.engine.evaluate(&mut *store, &regime, &account, &prices)?;
                if event.is_none() {
                    store.save_regime_state(account_id, &regime)?;
                }
                event
            } else {
                store.save_regime_state(account_id, &regime)?;
                None
            }
        };

        self.memories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id.to_string(), memory);
        log_regime(account_id, &regime);
        Ok(CycleOutcome { regime, event })
    }

    /// Equal-weight per-class return between two price sets. Classes with a
    /// member lacking a reference price are skipped for this cycle.
    fn class_returns(
        &self,
        previous: &BTreeMap<String, f64>,
        current: &BTreeMap<String, f64>,
    ) -> BTreeMap<AssetClass, f64> {
        let mut members: BTreeMap<AssetClass, Vec<Option<f64>>> = BTreeMap::new();
        for asset in self.universe.assets() {
            if asset.class == AssetClass::Cash {
                continue;
            }
            let r = match (previous.get(&asset.symbol), current.get(&asset.symbol)) {
                (Some(p0), Some(p1)) if *p0 > 0.0 => Some(p1 / p0 - 1.0),
                _ => None,
            };
            members.entry(asset.class).or_default().push(r);
        }
        members
            .into_iter()
            .filter_map(|(class, rs)| {
                let rs: Option<Vec<f64>> = rs.into_iter().collect();
                class_return(&rs?).map(|r| (class, r))
            })
            .collect()
    }

    fn memory_for(&self, account_id: &str) -> MarketMemory {
        self.memories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| self.seed.clone())
    }

    fn account_lock(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    fn store(&self) -> Result<std::sync::MutexGuard<'_, S>, StoreError> {
        self.store.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn report<T>(operation: &str, account_id: &str, res: CycleResult<T>) -> CycleResult<T> {
    if let Err(e) = &res {
        log_cycle_failure(account_id, operation, &e.to_string());
    }
    res
}

/// Mean across members over their common (most recent) length.
fn equal_weight(members: &[Vec<f64>]) -> Vec<f64> {
    let n = members.iter().map(Vec::len).min().unwrap_or(0);
    (0..n)
        .filter_map(|i| {
            let at: Vec<f64> = members.iter().map(|m| m[m.len() - n + i]).collect();
            class_return(&at)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_weight_aligns_on_the_newest_values() {
        let a = vec![9.0, 0.02, 0.04];
        let b = vec![0.0, 0.02];
        assert_eq!(equal_weight(&[a, b]), vec![0.01, 0.03]);
        assert!(equal_weight(&[]).is_empty());
    }
}
