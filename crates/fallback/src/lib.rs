//! Heuristic fallback bidding.
//!
//! When the real platform path is unavailable the dispatcher bids a fraction of the
//! median recently observed LTV, scaled by a per-platform multiplier. The median makes
//! the estimate depend only on the multiset of samples, never on their arrival order.

#![deny(unsafe_code)]

use bid_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Bounded FIFO of observed predicted LTV values. Oldest samples are evicted first.
#[derive(Debug)]
pub struct LtvHistory {
    capacity: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl Default for LtvHistory {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
            samples: Mutex::new(VecDeque::with_capacity(DEFAULT_HISTORY_CAPACITY)),
        }
    }
}

impl LtvHistory {
    pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid("fallback.history_capacity", "must be > 0"));
        }
        Ok(Self { capacity, samples: Mutex::new(VecDeque::with_capacity(capacity)) })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f64>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a sample, evicting the oldest when full. Non-finite or negative values are
    /// dropped.
    pub fn observe(&self, ltv: f64) {
        if !ltv.is_finite() || ltv < 0.0 {
            return;
        }
        let mut s = self.lock();
        if s.len() == self.capacity {
            s.pop_front();
        }
        s.push_back(ltv);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the samples, oldest first.
    pub fn snapshot(&self) -> Vec<f64> {
        self.lock().iter().copied().collect()
    }

    pub fn median(&self) -> Option<f64> {
        median(&self.snapshot())
    }
}

/// Median of `values`; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// `median(history) × multiplier × base_fraction`, or `None` for an empty history.
pub fn estimate_from(history: &[f64], multiplier: f64, base_fraction: f64) -> Option<f64> {
    median(history).map(|m| m * multiplier * base_fraction)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Share of the estimated LTV to bid.
    pub base_fraction: f64,
    /// Bid used when no history exists yet.
    pub baseline_bid: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { base_fraction: 0.30, baseline_bid: 5.0 }
    }
}

/// How a fallback amount was derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub amount: f64,
    /// `None` when the baseline was used.
    pub median: Option<f64>,
    pub samples: usize,
}

impl Estimate {
    pub fn used_baseline(&self) -> bool {
        self.median.is_none()
    }

    /// Whether the amount can be placed as a bid.
    pub fn is_biddable(&self) -> bool {
        self.amount.is_finite() && self.amount > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct HeuristicFallback {
    cfg: FallbackConfig,
}

impl HeuristicFallback {
    pub fn new(cfg: FallbackConfig) -> Result<Self, ConfigError> {
        if !cfg.base_fraction.is_finite() || cfg.base_fraction <= 0.0 || cfg.base_fraction > 1.0 {
            return Err(ConfigError::invalid("fallback.base_fraction", "must be in (0, 1]"));
        }
        if !cfg.baseline_bid.is_finite() || cfg.baseline_bid <= 0.0 {
            return Err(ConfigError::invalid("fallback.baseline_bid", "must be > 0"));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.cfg
    }

    pub fn estimate(&self, history: &LtvHistory, multiplier: f64) -> Estimate {
        let samples = history.snapshot();
        match estimate_from(&samples, multiplier, self.cfg.base_fraction) {
            Some(amount) => Estimate { amount, median: median(&samples), samples: samples.len() },
            None => Estimate { amount: self.cfg.baseline_bid, median: None, samples: 0 },
        }
    }
}
