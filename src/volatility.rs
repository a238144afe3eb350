//! Rolling return windows and their dispersion.

use std::collections::{BTreeMap, VecDeque};

use crate::types::AssetClass;

/// Fixed-capacity ring of returns with running sum and sum of squares,
/// so every update and every read is O(1).
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sum_sq: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Append `x`, evicting the oldest value when full. Non-finite input is
    /// dropped so one bad tick cannot poison the running sums.
    pub fn push(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        if self.values.len() == self.capacity {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(x);
        self.sum += x;
        self.sum_sq += x * x;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.sum / self.values.len() as f64)
    }

    /// Population standard deviation.
    pub fn std(&self) -> Option<f64> {
        let mean = self.mean()?;
        let n = self.values.len() as f64;
        let var = (self.sum_sq / n - mean * mean).max(0.0);
        Some(var.sqrt())
    }

    pub fn values(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }
}

/// One rolling window per asset class. Cash never gets one.
#[derive(Debug, Clone, PartialEq)]
pub struct VolatilityTracker {
    windows: BTreeMap<AssetClass, RollingWindow>,
    capacity: usize,
}

impl VolatilityTracker {
    pub fn new(capacity: usize) -> Self {
        Self { windows: BTreeMap::new(), capacity: capacity.max(1) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one periodic return per class.
    pub fn observe(&mut self, returns: &BTreeMap<AssetClass, f64>) {
        for (class, r) in returns {
            if *class == AssetClass::Cash {
                continue;
            }
            let cap = self.capacity;
            self.windows
                .entry(*class)
                .or_insert_with(|| RollingWindow::new(cap))
                .push(*r);
        }
    }

    /// Seed a class from a historical return series; only the newest
    /// `capacity` values survive.
    pub fn seed(&mut self, class: AssetClass, returns: &[f64]) {
        let mut w = RollingWindow::new(self.capacity);
        for r in returns {
            w.push(*r);
        }
        self.windows.insert(class, w);
    }

    /// Copy with every window re-seeded at `capacity` or more.
    pub fn widened(&self, capacity: usize) -> Self {
        let mut out = Self::new(self.capacity.max(capacity));
        for (class, w) in &self.windows {
            let values: Vec<f64> = w.values().copied().collect();
            out.seed(*class, &values);
        }
        out
    }

    /// Current volatility for a class; `None` while its window is empty.
    pub fn volatility(&self, class: AssetClass) -> Option<f64> {
        self.windows.get(&class).and_then(RollingWindow::std)
    }

    pub fn window(&self, class: AssetClass) -> Option<&RollingWindow> {
        self.windows.get(&class)
    }
}

/// Simple returns `p[i] / p[i-1] - 1`, skipping non-positive predecessors.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Equal-weight mean of the given returns; `None` for an empty slice.
pub fn class_return(member_returns: &[f64]) -> Option<f64> {
    if member_returns.is_empty() {
        return None;
    }
    Some(member_returns.iter().sum::<f64>() / member_returns.len() as f64)
}
