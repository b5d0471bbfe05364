use bid_core::{BidRequest, BidSource, Platform, RejectReason, VirtualClock};
use dispatcher::{Dispatcher, PlatformSettings, ScriptedConnector, Step};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_concurrent_bids_never_exceed_budget() {
    let clock = Arc::new(VirtualClock::new(1_000_000));
    let conn = Arc::new(ScriptedConnector::new(
        Platform::GoogleAds,
        Step::accept().after(Duration::from_millis(5)),
    ));
    let mut settings = PlatformSettings::new(Platform::GoogleAds, 1_000.0, Duration::from_secs(600));
    settings.rate_limit.max_calls = 1_000;
    let d = Arc::new(Dispatcher::new(settings, conn, clock).unwrap());

    let mut handles = Vec::new();
    for i in 0..100 {
        let d = Arc::clone(&d);
        handles.push(tokio::spawn(async move {
            let req = BidRequest::new(format!("cust-{i}"), "camp", Platform::GoogleAds, 50.0, 15.0);
            d.submit(&req).await
        }));
    }
    let mut ai = 0;
    let mut over = 0;
    for h in handles {
        let resp = h.await.unwrap();
        match (resp.source, resp.rejection) {
            (Some(BidSource::Ai), None) => ai += 1,
            (None, Some(RejectReason::BudgetExceeded)) => over += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(ai, 66);
    assert_eq!(over, 34);
    let stats = d.budget().stats();
    assert!((stats.current_spend - 990.0).abs() < 1e-9);
    assert_eq!(stats.reserved_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limit_holds_under_concurrency() {
    let clock = Arc::new(VirtualClock::new(1_000_000));
    let conn = Arc::new(ScriptedConnector::always_accept(Platform::TradeDesk));
    let mut settings = PlatformSettings::new(Platform::TradeDesk, 10_000.0, Duration::from_secs(600));
    settings.rate_limit.max_calls = 5;
    let d = Arc::new(Dispatcher::new(settings, conn.clone(), clock).unwrap());

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let d = Arc::clone(&d);
            tokio::spawn(async move {
                d.submit(&BidRequest::new("c", "k", Platform::TradeDesk, 1.0, 1.0)).await
            })
        })
        .collect();
    let mut limited = 0;
    for h in handles {
        if h.await.unwrap().rejection == Some(RejectReason::RateLimited) {
            limited += 1;
        }
    }
    assert_eq!(limited, 35);
    assert_eq!(conn.calls(), 5);
    assert!((d.budget().stats().current_spend - 5.0).abs() < 1e-9);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn window_sum_stays_within_budget(amounts in proptest::collection::vec(0.01f64..400.0, 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let clock = Arc::new(VirtualClock::new(0));
        let conn = Arc::new(ScriptedConnector::always_accept(Platform::LinkedIn));
        let settings = PlatformSettings::new(Platform::LinkedIn, 1_000.0, Duration::from_secs(60));
        let d = Dispatcher::new(settings, conn, clock.clone()).unwrap();
        rt.block_on(async {
            for a in &amounts {
                d.submit(&BidRequest::new("c", "k", Platform::LinkedIn, 10.0, *a)).await;
                clock.advance_ms(1_000);
                prop_assert!(d.budget().stats().current_spend <= 1_000.0 + 1e-9);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
