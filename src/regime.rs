//! Regime classification from standardized rolling volatility.
//!
//! The baseline is fixed at construction. It is never refreshed from the live
//! window, otherwise a volatility spike would drag its own reference upwards.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

use crate::types::{AssetClass, DetectedBy, Regime, RegimeState};
use crate::volatility::{RollingWindow, VolatilityTracker};

const STD_NOISE_FLOOR: f64 = 1e-12;

/// Reference level of volatility for one asset class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Baseline {
    pub mean: f64,
    pub std: f64,
}

impl Baseline {
    pub fn new(mean: f64, std: f64) -> Self {
        Self { mean, std }
    }

    /// A flat or broken baseline cannot standardize anything. A std at
    /// rounding-noise level relative to the mean counts as flat.
    pub fn is_degenerate(&self) -> bool {
        let floor = STD_NOISE_FLOOR * self.mean.abs().max(1.0);
        !(self.std.is_finite() && self.std > floor && self.mean.is_finite())
    }

    /// Mean and sample std of the last `lookback` rolling `window`-length
    /// volatilities over a historical return series. `None` when the history
    /// is too short to produce two rolling values.
    pub fn from_returns(returns: &[f64], window: usize, lookback: usize) -> Option<Self> {
        let mut ring = RollingWindow::new(window);
        let mut vols = Vec::new();
        for r in returns {
            ring.push(*r);
            if ring.len() == ring.capacity() {
                if let Some(v) = ring.std() {
                    vols.push(v);
                }
            }
        }
        let tail = &vols[vols.len().saturating_sub(lookback)..];
        if tail.len() < 2 {
            return None;
        }
        let n = tail.len() as f64;
        let mean = tail.iter().sum::<f64>() / n;
        let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Some(Self { mean, std: var.sqrt() })
    }
}

/// Lower bounds of the turbulent and crash tiers, inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub turbulent: f64,
    pub crash: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { turbulent: 2.0, crash: 3.0 }
    }
}

impl Thresholds {
    /// Evaluated high to low so the more severe tier wins ties.
    pub fn classify(&self, z: f64) -> Regime {
        if z >= self.crash {
            Regime::Crash
        } else if z >= self.turbulent {
            Regime::Turbulent
        } else {
            Regime::Calm
        }
    }
}

/// Stateless classifier over a tracker's window for the driving class.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    thresholds: Thresholds,
    driver: AssetClass,
    baselines: BTreeMap<AssetClass, Baseline>,
}

impl RegimeDetector {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds, driver: AssetClass::Risky, baselines: BTreeMap::new() }
    }

    pub fn with_baseline(mut self, class: AssetClass, baseline: Baseline) -> Self {
        self.baselines.insert(class, baseline);
        self
    }

    pub fn set_baseline(&mut self, class: AssetClass, baseline: Baseline) {
        self.baselines.insert(class, baseline);
    }

    pub fn baseline(&self, class: AssetClass) -> Option<Baseline> {
        self.baselines.get(&class).copied()
    }

    pub fn driver(&self) -> AssetClass {
        self.driver
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Append the cycle's returns, then classify.
    pub fn observe(
        &self,
        tracker: &mut VolatilityTracker,
        returns_by_class: &BTreeMap<AssetClass, f64>,
    ) -> RegimeState {
        tracker.observe(returns_by_class);
        self.detect(tracker)
    }

    /// Always yields a full state; degenerate input lands on calm.
    pub fn detect(&self, tracker: &VolatilityTracker) -> RegimeState {
        let baseline = self.baseline(self.driver).unwrap_or(Baseline::new(0.0, 0.0));
        let current_vol = tracker.volatility(self.driver);

        let (regime, z_score, detected_by) = match current_vol {
            Some(vol) if !baseline.is_degenerate() && vol.is_finite() => {
                let z = (vol - baseline.mean) / baseline.std;
                (self.thresholds.classify(z), z, DetectedBy::ZScore)
            }
            _ => (Regime::Calm, 0.0, DetectedBy::Fallback),
        };

        RegimeState {
            regime,
            z_score,
            current_vol: current_vol.unwrap_or(0.0),
            baseline_mean: baseline.mean,
            baseline_std: baseline.std,
            detected_by,
            as_of: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(returns: &[f64]) -> VolatilityTracker {
        let mut t = VolatilityTracker::new(30);
        t.seed(AssetClass::Risky, returns);
        t
    }

    #[test]
    fn tier_boundaries_are_inclusive_on_the_lower_bound() {
        let th = Thresholds::default();
        assert_eq!(th.classify(-5.0), Regime::Calm);
        assert_eq!(th.classify(1.999_999), Regime::Calm);
        assert_eq!(th.classify(2.0), Regime::Turbulent);
        assert_eq!(th.classify(2.999_999), Regime::Turbulent);
        assert_eq!(th.classify(3.0), Regime::Crash);
        assert_eq!(th.classify(42.0), Regime::Crash);
    }

    #[test]
    fn z_score_is_standardized_current_vol() {
        // alternating +/-0.03 gives population std exactly 0.03
        let returns: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 0.03 } else { -0.03 }).collect();
        let det = RegimeDetector::new(Thresholds::default())
            .with_baseline(AssetClass::Risky, Baseline::new(0.02, 0.004));
        let state = det.detect(&tracker_with(&returns));

        assert!((state.current_vol - 0.03).abs() < 1e-12);
        assert!((state.z_score - 2.5).abs() < 1e-9);
        assert_eq!(state.regime, Regime::Turbulent);
        assert_eq!(state.level(), 2);
        assert_eq!(state.detected_by, DetectedBy::ZScore);
    }

    #[test]
    fn zero_baseline_std_defaults_to_calm() {
        let det = RegimeDetector::new(Thresholds::default())
            .with_baseline(AssetClass::Risky, Baseline::new(0.02, 0.0));
        let state = det.detect(&tracker_with(&[0.5, -0.5, 0.5, -0.5]));
        assert_eq!(state.regime, Regime::Calm);
        assert_eq!(state.z_score, 0.0);
        assert_eq!(state.detected_by, DetectedBy::Fallback);
    }

    #[test]
    fn empty_window_defaults_to_calm() {
        let det = RegimeDetector::new(Thresholds::default())
            .with_baseline(AssetClass::Risky, Baseline::new(0.02, 0.005));
        let state = det.detect(&VolatilityTracker::new(30));
        assert_eq!(state.level(), 1);
        assert_eq!(state.regime_name(), "calm");
        assert_eq!(state.current_vol, 0.0);
    }

    #[test]
    fn missing_baseline_defaults_to_calm() {
        let det = RegimeDetector::new(Thresholds::default());
        let state = det.detect(&tracker_with(&[0.1, -0.1]));
        assert_eq!(state.regime, Regime::Calm);
    }

    #[test]
    fn observe_appends_then_classifies() {
        let det = RegimeDetector::new(Thresholds::default())
            .with_baseline(AssetClass::Risky, Baseline::new(0.01, 0.001));
        let mut t = tracker_with(&[0.01, -0.01]);
        let mut returns = BTreeMap::new();
        returns.insert(AssetClass::Risky, 0.4);
        let state = det.observe(&mut t, &returns);
        assert_eq!(t.window(AssetClass::Risky).unwrap().len(), 3);
        assert_eq!(state.regime, Regime::Crash);
    }

    #[test]
    fn baseline_from_history() {
        // constant-magnitude alternation: every rolling vol is identical
        let flat: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        let b = Baseline::from_returns(&flat, 10, 90).unwrap();
        assert!((b.mean - 0.01).abs() < 1e-9);
        assert!(b.std < 1e-9);

        assert!(Baseline::from_returns(&flat[..10], 10, 90).is_none());
    }

    #[test]
    fn flat_history_baseline_detects_calm() {
        let flat: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        let b = Baseline::from_returns(&flat, 30, 90).unwrap();
        assert!(b.is_degenerate());

        let det = RegimeDetector::new(Thresholds::default()).with_baseline(AssetClass::Risky, b);
        let mut t = tracker_with(&flat[..29]);
        let mut returns = BTreeMap::new();
        returns.insert(AssetClass::Risky, 0.0101);
        let state = det.observe(&mut t, &returns);
        assert_eq!(state.regime, Regime::Calm);
        assert_eq!(state.z_score, 0.0);
        assert_eq!(state.detected_by, DetectedBy::Fallback);

        assert!(!Baseline::new(0.02, 0.005).is_degenerate());
    }

    #[test]
    fn baseline_uses_only_the_lookback_tail() {
        let mut returns: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        returns.extend((0..40).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }));
        let b = Baseline::from_returns(&returns, 4, 5).unwrap();
        assert!((b.mean - 0.01).abs() < 1e-9);
    }
}
