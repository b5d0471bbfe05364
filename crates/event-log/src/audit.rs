//! Typed audit payload written for every admitted or rejected bid.

use bid_core::{BidRequest, BidResponse, BidSource, Platform, RejectReason};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
}

/// Field order is the serialization order; keep it stable for log consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidAuditRecord {
    pub event: String,
    pub trace_id: String,
    pub platform: Platform,
    pub customer_id: String,
    pub campaign_id: String,
    pub outcome: AuditOutcome,
    pub source: Option<BidSource>,
    pub reason: Option<RejectReason>,
    /// `None` when the request carried a non-finite value (JSON has no NaN).
    pub proposed_amount: Option<f64>,
    pub final_amount: f64,
    pub predicted_ltv: Option<f64>,
    pub platform_reference_id: Option<String>,
    pub breaker_state: String,
    pub attempts: u32,
    pub latency_ms: u64,
    pub message: String,
    pub ts_ms: u64,
}

impl BidAuditRecord {
    pub const EVENT: &'static str = "bid_outcome";

    pub fn from_outcome(
        req: &BidRequest,
        resp: &BidResponse,
        breaker_state: &str,
        attempts: u32,
        latency_ms: u64,
    ) -> Self {
        Self {
            event: Self::EVENT.to_string(),
            trace_id: req.trace_id.clone(),
            platform: req.platform,
            customer_id: req.customer_id.clone(),
            campaign_id: req.campaign_id.clone(),
            outcome: if resp.accepted { AuditOutcome::Accepted } else { AuditOutcome::Rejected },
            source: resp.source,
            reason: resp.rejection,
            proposed_amount: finite(req.proposed_bid_amount),
            final_amount: finite(resp.amount).unwrap_or(0.0),
            predicted_ltv: finite(req.predicted_ltv),
            platform_reference_id: resp.platform_reference_id.clone(),
            breaker_state: breaker_state.to_string(),
            attempts,
            latency_ms,
            message: resp.message.clone(),
            ts_ms: resp.finalized_at_ms,
        }
    }

    /// Label used when grouping records: the rejection reason, else the source.
    pub fn label(&self) -> &'static str {
        match (self.reason, self.source) {
            (Some(r), _) => r.as_str(),
            (None, Some(s)) => s.as_str(),
            (None, None) => "unknown",
        }
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventRecord, JsonlEventLog};

    #[test]
    fn record_captures_request_and_response() {
        let req = BidRequest::new("cust", "camp", Platform::TikTok, 250.0, 40.0);
        let resp = BidResponse::fallback(22.5, "circuit open", 99);
        let rec = BidAuditRecord::from_outcome(&req, &resp, "open", 0, 3);
        assert_eq!(rec.outcome, AuditOutcome::Accepted);
        assert_eq!(rec.source, Some(BidSource::Fallback));
        assert_eq!(rec.label(), "fallback");
        assert_eq!(rec.ts_ms, 99);

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["event"], "bid_outcome");
        assert_eq!(v["platform"], "tiktok");
        assert_eq!(v["source"], "fallback");
        assert!(v["reason"].is_null());
    }

    #[test]
    fn rejection_label() {
        let req = BidRequest::new("cust", "camp", Platform::Meta, 10.0, 5.0);
        let resp = BidResponse::rejected(RejectReason::BudgetExceeded, "over", 1);
        let rec = BidAuditRecord::from_outcome(&req, &resp, "closed", 0, 0);
        assert_eq!(rec.outcome, AuditOutcome::Rejected);
        assert_eq!(rec.label(), "budget_exceeded");
    }

    #[test]
    fn non_finite_request_values_keep_the_log_readable() {
        let mut req = BidRequest::new("cust", "camp", Platform::X, 10.0, 5.0);
        req.proposed_bid_amount = f64::NAN;
        req.predicted_ltv = f64::INFINITY;
        let resp = BidResponse::rejected(RejectReason::Validation, "bad amount", 7);
        let rec = BidAuditRecord::from_outcome(&req, &resp, "closed", 0, 0);
        assert_eq!(rec.proposed_amount, None);
        assert_eq!(rec.predicted_ltv, None);

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let log = JsonlEventLog::open(tmp.path()).unwrap();
        log.append(1, 7, &rec).unwrap();
        let ok = BidAuditRecord::from_outcome(
            &BidRequest::new("cust", "camp", Platform::X, 10.0, 5.0),
            &BidResponse::ai("ref", 5.0, 8),
            "closed",
            1,
            3,
        );
        log.append(2, 8, &ok).unwrap();

        let got: Vec<EventRecord<BidAuditRecord>> = log.read_all().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload.label(), "validation");
        assert_eq!(got[1].payload.proposed_amount, Some(5.0));
        assert_eq!(got[1].payload.predicted_ltv, Some(10.0));
    }
}
