//! Bid request/response model and the reference platform table.

use crate::error::{RejectReason, ValidationError};
use crate::ids::{new_trace_id, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Advertising platforms with a dedicated dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "google_ads")]
    GoogleAds,
    #[serde(rename = "meta")]
    Meta,
    #[serde(rename = "tradedesk")]
    TradeDesk,
    #[serde(rename = "amazon")]
    Amazon,
    #[serde(rename = "x")]
    X,
    #[serde(rename = "linkedin")]
    LinkedIn,
    #[serde(rename = "tiktok")]
    TikTok,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::GoogleAds,
        Platform::Meta,
        Platform::TradeDesk,
        Platform::Amazon,
        Platform::X,
        Platform::LinkedIn,
        Platform::TikTok,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleAds => "google_ads",
            Self::Meta => "meta",
            Self::TradeDesk => "tradedesk",
            Self::Amazon => "amazon",
            Self::X => "x",
            Self::LinkedIn => "linkedin",
            Self::TikTok => "tiktok",
        }
    }

    /// Fallback bid multiplier applied on top of the LTV median.
    pub fn default_multiplier(self) -> f64 {
        match self {
            Self::GoogleAds | Self::Meta | Self::TradeDesk | Self::Amazon => 1.0,
            Self::X => 0.75,
            Self::LinkedIn => 1.2,
            Self::TikTok => 1.5,
        }
    }

    /// Reference `(max_calls, window)` quota for the platform API.
    pub fn default_rate_limit(self) -> (u32, Duration) {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        match self {
            Self::GoogleAds => (100, Duration::from_secs(MINUTE)),
            Self::Meta => (200, Duration::from_secs(HOUR)),
            Self::TradeDesk => (50, Duration::from_secs(MINUTE)),
            Self::Amazon => (40, Duration::from_secs(15 * MINUTE)),
            Self::X => (400, Duration::from_secs(24 * HOUR)),
            Self::LinkedIn => (1000, Duration::from_secs(HOUR)),
            Self::TikTok => (300, Duration::from_secs(MINUTE)),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| format!("unknown platform: {s}"))
    }
}

/// A single outgoing bid. Built once by the caller and only borrowed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRequest {
    /// Correlates the request with its audit record and log lines.
    pub trace_id: String,
    pub customer_id: String,
    pub campaign_id: String,
    pub platform: Platform,
    pub predicted_ltv: f64,
    pub proposed_bid_amount: f64,
    /// Opaque attribution data forwarded to the platform connector.
    pub attribution_payload: JsonValue,
    pub requested_at_ms: u64,
}

impl BidRequest {
    pub fn new(
        customer_id: impl Into<String>,
        campaign_id: impl Into<String>,
        platform: Platform,
        predicted_ltv: f64,
        proposed_bid_amount: f64,
    ) -> Self {
        Self {
            trace_id: new_trace_id(),
            customer_id: customer_id.into(),
            campaign_id: campaign_id.into(),
            platform,
            predicted_ltv,
            proposed_bid_amount,
            attribution_payload: JsonValue::Null,
            requested_at_ms: now_ms(),
        }
    }

    pub fn with_attribution(mut self, payload: JsonValue) -> Self {
        self.attribution_payload = payload;
        self
    }

    /// Structural validation; has no side effects.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.customer_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("customer_id"));
        }
        if self.campaign_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("campaign_id"));
        }
        if !self.proposed_bid_amount.is_finite() || self.proposed_bid_amount <= 0.0 {
            return Err(ValidationError::InvalidBidAmount(self.proposed_bid_amount));
        }
        if !self.predicted_ltv.is_finite() || self.predicted_ltv < 0.0 {
            return Err(ValidationError::InvalidLtv(self.predicted_ltv));
        }
        Ok(())
    }
}

/// Who produced the final bid amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidSource {
    /// The real platform call succeeded.
    Ai,
    /// A locally computed substitute was used.
    Fallback,
}

impl BidSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Fallback => "fallback",
        }
    }
}

/// Terminal outcome of one bid request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidResponse {
    pub accepted: bool,
    pub platform_reference_id: Option<String>,
    pub message: String,
    /// `None` when the bid was rejected before any amount was produced.
    pub source: Option<BidSource>,
    /// Amount recorded against the budget (0 when nothing was spent).
    pub amount: f64,
    pub rejection: Option<RejectReason>,
    pub finalized_at_ms: u64,
}

impl BidResponse {
    pub fn ai(reference_id: impl Into<String>, amount: f64, finalized_at_ms: u64) -> Self {
        Self {
            accepted: true,
            platform_reference_id: Some(reference_id.into()),
            message: "bid placed".into(),
            source: Some(BidSource::Ai),
            amount,
            rejection: None,
            finalized_at_ms,
        }
    }

    pub fn fallback(amount: f64, message: impl Into<String>, finalized_at_ms: u64) -> Self {
        Self {
            accepted: true,
            platform_reference_id: None,
            message: message.into(),
            source: Some(BidSource::Fallback),
            amount,
            rejection: None,
            finalized_at_ms,
        }
    }

    pub fn declined(reference_id: impl Into<String>, finalized_at_ms: u64) -> Self {
        Self {
            accepted: false,
            platform_reference_id: Some(reference_id.into()),
            message: "platform declined the bid".into(),
            source: Some(BidSource::Ai),
            amount: 0.0,
            rejection: Some(RejectReason::PlatformDeclined),
            finalized_at_ms,
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>, finalized_at_ms: u64) -> Self {
        Self {
            accepted: false,
            platform_reference_id: None,
            message: message.into(),
            source: None,
            amount: 0.0,
            rejection: Some(reason),
            finalized_at_ms,
        }
    }

    pub fn used_fallback(&self) -> bool {
        self.source == Some(BidSource::Fallback)
    }
}
