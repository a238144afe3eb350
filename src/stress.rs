//! Synthetic crash injection.
//!
//! The injected returns go through the same detector and engine as live data,
//! so an account already at crash gets the ordinary no-op. Injection happens
//! on a copy of the tracker; the live window never sees synthetic returns.

use std::collections::BTreeMap;

use crate::error::{CycleError, CycleResult};
use crate::rebalance::RebalancingEngine;
use crate::regime::{Baseline, RegimeDetector, Thresholds};
use crate::storage::Persistence;
use crate::types::{AccountState, DetectedBy, RebalanceEvent, RegimeState};
use crate::volatility::VolatilityTracker;

const MIN_WINDOW: usize = 2;

/// Result of one injection.
#[derive(Debug, Clone)]
pub struct StressOutcome {
    pub regime: RegimeState,
    pub event: Option<RebalanceEvent>,
}

#[derive(Debug, Clone)]
pub struct StressTestHarness {
    /// Used when the live baseline cannot standardize anything.
    fallback: Baseline,
}

impl StressTestHarness {
    pub fn new(fallback: Baseline) -> Self {
        Self { fallback }
    }

    /// Alternating returns whose population volatility sits well past the
    /// crash tier: amplitude is twice the vol at `crash + 1` deviations.
    pub fn crash_returns(baseline: Baseline, thresholds: Thresholds, len: usize) -> Vec<f64> {
        let target = baseline.mean.abs() + (thresholds.crash + 1.0) * baseline.std;
        let m = 2.0 * target;
        (0..len).map(|i| if i % 2 == 0 { -m } else { m }).collect()
    }

    /// Feed a full window of crash returns into a copy of `tracker`, one
    /// observation at a time, and classify. The copy holds at least two
    /// returns, otherwise its dispersion is always zero.
    pub fn inject(&self, detector: &RegimeDetector, tracker: &VolatilityTracker) -> (VolatilityTracker, RegimeState) {
        let mut detector = detector.clone();
        let driver = detector.driver();
        let baseline = match detector.baseline(driver) {
            Some(b) if !b.is_degenerate() => b,
            _ => {
                detector.set_baseline(driver, self.fallback);
                self.fallback
            }
        };

        let mut scratch = tracker.widened(MIN_WINDOW);
        let mut state = detector.detect(&scratch);
        for r in Self::crash_returns(baseline, detector.thresholds(), scratch.capacity()) {
            let mut obs = BTreeMap::new();
            obs.insert(driver, r);
            state = detector.observe(&mut scratch, &obs);
        }
        state.detected_by = DetectedBy::StressTest;
        (scratch, state)
    }

    /// Inject a crash for a deployed account and run the engine at `latest`,
    /// the newest polled prices. Symbols without one keep the price of the
    /// last allocation. No network is touched.
    pub fn inject_crash(
        &self,
        detector: &RegimeDetector,
        tracker: &VolatilityTracker,
        engine: &RebalancingEngine,
        store: &mut dyn Persistence,
        account: &AccountState,
        latest: &BTreeMap<String, f64>,
    ) -> CycleResult<StressOutcome> {
        if !account.deployed {
            return Err(CycleError::NotDeployed(account.account_id.clone()));
        }
        let allocation = store
            .load_allocation(&account.account_id)?
            .ok_or_else(|| CycleError::NotDeployed(account.account_id.clone()))?;
        let mut marks = allocation.prices();
        for (symbol, price) in latest {
            if marks.contains_key(symbol) && price.is_finite() && *price > 0.0 {
                marks.insert(symbol.clone(), *price);
            }
        }

        let (_, regime) = self.inject(detector, tracker);
        let mut account = account.clone();
        account.portfolio_value = allocation.mark_to_market(&marks);

        let event = engine.evaluate(store, &regime, &account, &marks)?;
        if event.is_none() {
            store.save_regime_state(&account.account_id, &regime)?;
        }
        Ok(StressOutcome { regime, event })
    }
}
