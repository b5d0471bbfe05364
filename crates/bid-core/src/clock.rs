//! Clock abstraction so sliding windows and breaker timers can run on virtual time.

use std::sync::{Mutex, PoisonError};

/// Clock abstraction for deterministic time in admission-control paths.
/// Returns milliseconds since UNIX epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System (production) clock. Wraps SystemTime.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        crate::ids::now_ms()
    }
}

/// Virtual (deterministic) clock with manual control.
#[derive(Debug)]
pub struct VirtualClock {
    inner: Mutex<u64>,
}

impl VirtualClock {
    /// Create a new virtual clock seeded at start_ms.
    pub fn new(start_ms: u64) -> Self {
        Self { inner: Mutex::new(start_ms) }
    }

    /// Advance the virtual clock by delta_ms.
    pub fn advance_ms(&self, delta_ms: u64) {
        let mut t = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *t = t.saturating_add(delta_ms);
    }

    /// Set the virtual clock to an absolute ms value.
    pub fn set_ms(&self, value: u64) {
        let mut t = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *t = value;
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
