//! Error taxonomy shared by the admission pipeline.
//!
//! Only [`ConfigError`] is fatal (construction time). Everything else is resolved by the
//! dispatcher into a terminal `BidResponse`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed bid request. Rejected immediately; never retried, never counted by the
/// breaker or the rate limiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("proposed bid amount must be finite and > 0 (got {0})")]
    InvalidBidAmount(f64),
    #[error("predicted LTV must be finite and >= 0 (got {0})")]
    InvalidLtv(f64),
    #[error("request for {got} routed to the {expected} dispatcher")]
    PlatformMismatch { expected: String, got: String },
}

/// Error returned by a platform connector attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("attempt timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl PlatformError {
    /// Map an HTTP-like status code onto the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 504 => Self::Timeout,
            503 => Self::Unavailable(message),
            500..=599 => Self::Server { status, message },
            _ => Self::Client { status, message },
        }
    }

    /// Transient errors are retried; permanent ones fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionRefused | Self::Unavailable(_) | Self::Server { .. }
        )
    }

    /// Short, low-cardinality label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::Unavailable(_) => "unavailable",
            Self::Server { .. } => "server",
            Self::Client { .. } => "client",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Fatal misconfiguration detected while constructing a component.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max budget must be finite and > 0 (got {0})")]
    NonPositiveBudget(f64),
    #[error("{0} window must be non-zero")]
    ZeroWindow(&'static str),
    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("no budget configured for platform {0}")]
    MissingBudget(String),
    #[error("platform {0} configured more than once")]
    DuplicatePlatform(String),
}

impl ConfigError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter { name, reason: reason.into() }
    }
}

/// Why a bid was not placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Validation,
    BudgetExceeded,
    RateLimited,
    Cancelled,
    /// The platform answered but declined the bid.
    PlatformDeclined,
    /// The fallback path produced no positive bid (e.g. every observed LTV was 0).
    NoFallbackBid,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::BudgetExceeded => "budget_exceeded",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::PlatformDeclined => "platform_declined",
            Self::NoFallbackBid => "no_fallback_bid",
        }
    }
}
