//! Sliding-window call counter for one platform API quota.

use bid_core::{Clock, ConfigError, Platform};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn for_platform(platform: Platform) -> Self {
        let (max_calls, window) = platform.default_rate_limit();
        Self { max_calls, window }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub in_window: usize,
    pub max_calls: u32,
    pub window_ms: u64,
}

/// At most `max_calls` timestamps survive in any trailing `window`.
pub struct RateLimiter {
    max_calls: u32,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    calls: Mutex<VecDeque<u64>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if cfg.max_calls == 0 {
            return Err(ConfigError::invalid("max_calls", "must be > 0"));
        }
        if cfg.window.is_zero() {
            return Err(ConfigError::ZeroWindow("rate limit"));
        }
        Ok(Self {
            max_calls: cfg.max_calls,
            window_ms: u64::try_from(cfg.window.as_millis()).unwrap_or(u64::MAX),
            clock,
            calls: Mutex::new(VecDeque::new()),
        })
    }

    fn pruned(&self) -> (MutexGuard<'_, VecDeque<u64>>, u64) {
        let now = self.clock.now_ms();
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let cutoff = now.saturating_sub(self.window_ms);
        while calls.front().is_some_and(|ts| *ts < cutoff) {
            calls.pop_front();
        }
        (calls, now)
    }

    /// Whether one more call fits in the window right now.
    pub fn can_make_call(&self) -> bool {
        let (calls, _) = self.pruned();
        calls.len() < self.max_calls as usize
    }

    /// Record a call at the current time.
    pub fn record_call(&self) {
        let (mut calls, now) = self.pruned();
        calls.push_back(now);
    }

    /// Atomic check-and-record: consumes a slot and returns true, or leaves the window
    /// untouched and returns false.
    pub fn try_acquire(&self) -> bool {
        let (mut calls, now) = self.pruned();
        if calls.len() >= self.max_calls as usize {
            return false;
        }
        calls.push_back(now);
        true
    }

    pub fn stats(&self) -> RateLimitStats {
        let (calls, _) = self.pruned();
        RateLimitStats { in_window: calls.len(), max_calls: self.max_calls, window_ms: self.window_ms }
    }
}
