//! Per-platform spend ledger over a sliding time window.
//!
//! Spend is held as `(timestamp, amount)` entries; anything older than the window is
//! pruned lazily on access. The admission path uses [`BudgetLedger::try_reserve`], which
//! prunes, sums and appends under one lock, so the window sum can never exceed the
//! configured maximum no matter how many callers race. The returned [`Reservation`] is
//! later confirmed at the real amount or released; dropping it unsettled releases it.

#![deny(unsafe_code)]

use bid_core::money::{from_micros, to_micros};
use bid_core::{Clock, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_budget: f64,
    pub window: Duration,
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_budget.is_finite() || self.max_budget <= 0.0 {
            return Err(ConfigError::NonPositiveBudget(self.max_budget));
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow("budget"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Within,
    Warning80,
    Warning90,
    Exceeded,
}

impl BudgetState {
    fn from_ratio(r: f64) -> Self {
        if r > 1.0 {
            BudgetState::Exceeded
        } else if r >= 0.90 {
            BudgetState::Warning90
        } else if r >= 0.80 {
            BudgetState::Warning80
        } else {
            BudgetState::Within
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStats {
    pub current_spend: f64,
    pub max_budget: f64,
    pub remaining: f64,
    pub entry_count: usize,
    /// Entries still held by in-flight bids.
    pub reserved_count: usize,
    pub utilization: f64,
    pub state: BudgetState,
}

/// Result of confirming a reservation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    /// Amount now recorded in the ledger for this bid.
    pub recorded: f64,
    /// True when the requested amount did not fit and was capped.
    pub capped: bool,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    ts_ms: u64,
    micros: u64,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    total_micros: u64,
    next_id: u64,
}

impl Inner {
    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(front) = self.entries.front() {
            if front.ts_ms >= cutoff {
                break;
            }
            self.total_micros -= front.micros;
            self.entries.pop_front();
        }
    }

    fn push(&mut self, ts_ms: u64, micros: u64, confirmed: bool) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push_back(Entry { id, ts_ms, micros, confirmed });
        self.total_micros += micros;
        id
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().rposition(|e| e.id == id)
    }
}

/// Sliding-window spend accumulator for one platform.
pub struct BudgetLedger {
    max_micros: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("max_micros", &self.max_micros)
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

impl BudgetLedger {
    /// Fails on a non-positive budget or a zero window; both are startup errors.
    pub fn new(cfg: &BudgetConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            max_micros: to_micros(cfg.max_budget),
            window_ms: u64::try_from(cfg.window.as_millis()).unwrap_or(u64::MAX),
            clock,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pruned(&self) -> MutexGuard<'_, Inner> {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        g.prune(now, self.window_ms);
        g
    }

    pub fn max_budget(&self) -> f64 {
        from_micros(self.max_micros)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Whether `amount` would still fit in the current window.
    ///
    /// Advisory only: pairing this with [`add_spend`](Self::add_spend) without an
    /// enclosing lock races. Admission must go through [`try_reserve`](Self::try_reserve).
    pub fn can_spend(&self, amount: f64) -> bool {
        let g = self.pruned();
        g.total_micros.saturating_add(to_micros(amount)) <= self.max_micros
    }

    /// Record spend unconditionally at the current time.
    pub fn add_spend(&self, amount: f64) {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        g.prune(now, self.window_ms);
        g.push(now, to_micros(amount), true);
    }

    /// Atomic check-and-reserve. `None` when `amount` does not fit.
    pub fn try_reserve(&self, amount: f64) -> Option<Reservation<'_>> {
        let micros = to_micros(amount);
        let now = self.clock.now_ms();
        let mut g = self.lock();
        g.prune(now, self.window_ms);
        if g.total_micros.saturating_add(micros) > self.max_micros {
            return None;
        }
        let id = g.push(now, micros, false);
        Some(Reservation { ledger: self, id, micros, settled: false })
    }

    fn release_entry(&self, id: u64) {
        let mut g = self.lock();
        if let Some(pos) = g.position(id) {
            if let Some(e) = g.entries.remove(pos) {
                g.total_micros -= e.micros;
            }
        }
    }

    /// Replaces the hold with a confirmed entry stamped now, so booked spend stays in
    /// the window for a full window length even when the call outlived its reservation.
    fn confirm_entry(&self, id: u64, reserved: u64, requested: u64) -> Settlement {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        g.prune(now, self.window_ms);
        if let Some(pos) = g.position(id) {
            if let Some(e) = g.entries.remove(pos) {
                g.total_micros -= e.micros;
            }
        }
        let room = self.max_micros.saturating_sub(g.total_micros);
        let (micros, capped) =
            if requested <= room { (requested, false) } else { (reserved.min(room), true) };
        if micros > 0 {
            g.push(now, micros, true);
        }
        Settlement { recorded: from_micros(micros), capped }
    }

    pub fn stats(&self) -> BudgetStats {
        let g = self.pruned();
        let current = g.total_micros;
        let utilization =
            if self.max_micros > 0 { current as f64 / self.max_micros as f64 } else { 0.0 };
        BudgetStats {
            current_spend: from_micros(current),
            max_budget: from_micros(self.max_micros),
            remaining: from_micros(self.max_micros.saturating_sub(current)),
            entry_count: g.entries.len(),
            reserved_count: g.entries.iter().filter(|e| !e.confirmed).count(),
            utilization,
            state: BudgetState::from_ratio(utilization),
        }
    }
}

/// Budget held by an in-flight bid. Settle with [`confirm`](Self::confirm) or
/// [`release`](Self::release); dropping it unsettled releases the hold.
#[must_use = "an unsettled reservation is released on drop"]
#[derive(Debug)]
pub struct Reservation<'a> {
    ledger: &'a BudgetLedger,
    id: u64,
    micros: u64,
    settled: bool,
}

impl Reservation<'_> {
    /// Amount originally admitted.
    pub fn amount(&self) -> f64 {
        from_micros(self.micros)
    }

    /// Record the final amount. A larger amount grows the hold only if the window
    /// still has room; otherwise the recorded amount is capped at what fits.
    pub fn confirm(mut self, amount: f64) -> Settlement {
        self.settled = true;
        self.ledger.confirm_entry(self.id, self.micros, to_micros(amount))
    }

    pub fn release(mut self) {
        self.settled = true;
        self.ledger.release_entry(self.id);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.release_entry(self.id);
        }
    }
}
