//! Bid admission core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the bid core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod clock;
pub mod error;
pub mod model;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use error::{ConfigError, PlatformError, RejectReason, ValidationError};
pub use model::{BidRequest, BidResponse, BidSource, Platform};

pub mod ids {
    //! ID utilities: wall-clock timestamps and trace ids.

    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// Milliseconds since UNIX epoch (for timestamps).
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// Opaque trace identifier (UUID v4 string).
    pub fn new_trace_id() -> String {
        Uuid::new_v4().to_string()
    }

}

pub mod money {
    //! Fixed-point money helpers. Ledgers account in micro-units so window sums are exact.

    /// Micro-units per currency unit.
    pub const MICROS_PER_UNIT: u64 = 1_000_000;

    /// Convert a currency amount into micro-units (rounded; negatives and NaN clamp to 0).
    pub fn to_micros(amount: f64) -> u64 {
        if !amount.is_finite() || amount <= 0.0 {
            return 0;
        }
        (amount * MICROS_PER_UNIT as f64).round() as u64
    }

    /// Convert micro-units back into a currency amount.
    pub fn from_micros(micros: u64) -> f64 {
        micros as f64 / MICROS_PER_UNIT as f64
    }

}
