//! Three-state circuit breaker.
//!
//! ```text
//! Closed   -> Open     : failure_threshold consecutive failures or slow calls
//! Open     -> HalfOpen : first can_execute() after reset_timeout
//! HalfOpen -> Closed   : half_open_successes_required consecutive successes
//! HalfOpen -> Open     : any failure (reset clock restarts)
//! ```
//!
//! HalfOpen admits one probe at a time. A probe that never reports back (its caller was
//! dropped) stops blocking once `reset_timeout` has passed since it was admitted.

use bid_core::Clock;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_successes_required: u32,
    /// Successful calls slower than this count as failures.
    pub slow_call_threshold: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_successes_required: 2,
            slow_call_threshold: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_half_open_successes: u32,
    pub last_transition_at_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_half_open_successes: u32,
    last_transition_at_ms: u64,
    probe_started_at_ms: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    reset_ms: u64,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("cfg", &self.cfg)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            name: name.into(),
            cfg,
            reset_ms: u64::try_from(cfg.reset_timeout.as_millis()).unwrap_or(u64::MAX),
            clock,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_half_open_successes: 0,
                last_transition_at_ms: now,
                probe_started_at_ms: None,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.cfg
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe_blocking(&self, inner: &Inner, now: u64) -> bool {
        inner.probe_started_at_ms.is_some_and(|t| now.saturating_sub(t) < self.reset_ms)
    }

    /// Whether a real platform call may be attempted now.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now_ms();
        {
            let g = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match g.state {
                BreakerState::Closed => return true,
                BreakerState::Open if now.saturating_sub(g.last_transition_at_ms) < self.reset_ms => {
                    return false
                }
                BreakerState::HalfOpen if self.probe_blocking(&g, now) => return false,
                _ => {}
            }
        }
        let mut g = self.write();
        match g.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now.saturating_sub(g.last_transition_at_ms) < self.reset_ms {
                    return false;
                }
                g.state = BreakerState::HalfOpen;
                g.consecutive_half_open_successes = 0;
                g.last_transition_at_ms = now;
                g.probe_started_at_ms = Some(now);
                info!(breaker = %self.name, "circuit half-open: admitting probe");
                true
            }
            BreakerState::HalfOpen => {
                if self.probe_blocking(&g, now) {
                    return false;
                }
                g.probe_started_at_ms = Some(now);
                true
            }
        }
    }

    /// Record one call outcome. A success slower than the slow-call threshold counts as
    /// a failure.
    pub fn record_result(&self, success: bool, latency: Duration) {
        let failed = !success || latency > self.cfg.slow_call_threshold;
        let now = self.clock.now_ms();
        let mut g = self.write();
        match g.state {
            BreakerState::Closed => {
                if failed {
                    g.consecutive_failures += 1;
                    if g.consecutive_failures >= self.cfg.failure_threshold {
                        self.trip(&mut g, now);
                    }
                } else {
                    g.consecutive_failures = 0;
                }
            }
            BreakerState::HalfOpen => {
                g.probe_started_at_ms = None;
                if failed {
                    self.trip(&mut g, now);
                } else {
                    g.consecutive_half_open_successes += 1;
                    if g.consecutive_half_open_successes >= self.cfg.half_open_successes_required {
                        g.state = BreakerState::Closed;
                        g.consecutive_failures = 0;
                        g.consecutive_half_open_successes = 0;
                        g.last_transition_at_ms = now;
                        info!(breaker = %self.name, "circuit closed");
                    }
                }
            }
            // late results from calls admitted before the trip
            BreakerState::Open => {}
        }
    }

    /// Give back a HalfOpen probe slot that was admitted but never used.
    pub fn cancel_probe(&self) {
        let mut g = self.write();
        if g.state == BreakerState::HalfOpen {
            g.probe_started_at_ms = None;
        }
    }

    fn trip(&self, g: &mut Inner, now: u64) {
        warn!(
            breaker = %self.name,
            from = g.state.as_str(),
            failures = g.consecutive_failures,
            "circuit opened"
        );
        g.state = BreakerState::Open;
        g.consecutive_half_open_successes = 0;
        g.last_transition_at_ms = now;
        g.probe_started_at_ms = None;
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let g = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        BreakerSnapshot {
            state: g.state,
            consecutive_failures: g.consecutive_failures,
            consecutive_half_open_successes: g.consecutive_half_open_successes,
            last_transition_at_ms: g.last_transition_at_ms,
        }
    }
}
