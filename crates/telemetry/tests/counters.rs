use bid_core::{BidSource, Platform, RejectReason};
use proptest::prelude::*;
use std::time::Duration;
use telemetry::{BidMetrics, MetricsSink, OutcomeEvent};

fn arb_outcome() -> impl Strategy<Value = (Option<BidSource>, Option<RejectReason>)> {
    prop_oneof![
        Just((Some(BidSource::Ai), None)),
        Just((Some(BidSource::Fallback), None)),
        Just((None, Some(RejectReason::Validation))),
        Just((None, Some(RejectReason::BudgetExceeded))),
        Just((None, Some(RejectReason::RateLimited))),
        Just((None, Some(RejectReason::Cancelled))),
        Just((Some(BidSource::Ai), Some(RejectReason::PlatformDeclined))),
        Just((None, Some(RejectReason::NoFallbackBid))),
    ]
}

proptest! {
    #[test]
    fn every_outcome_is_counted_once(outcomes in proptest::collection::vec(arb_outcome(), 0..200)) {
        let m = BidMetrics::new();
        for (source, reason) in &outcomes {
            let accepted = reason.is_none();
            m.record(&OutcomeEvent {
                platform: Platform::GoogleAds,
                accepted,
                source: *source,
                reason: *reason,
                breaker_state: "closed",
                latency: Duration::from_millis(1),
                amount: if accepted { 1.0 } else { 0.0 },
                attempts: u32::from(source.is_some()),
            });
        }
        let s = m.snapshot();
        let rejected: u64 = s.rejected.iter().map(|(_, n)| n).sum();
        prop_assert_eq!(s.outcomes, outcomes.len() as u64);
        prop_assert_eq!(s.accepted + rejected, s.outcomes);
        prop_assert_eq!(s.spend, s.accepted as f64);
        prop_assert_eq!(s.latency_ms_total, s.outcomes);
    }
}
