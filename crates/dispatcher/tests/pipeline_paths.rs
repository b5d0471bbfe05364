use async_trait::async_trait;
use bid_core::{BidRequest, BidSource, Platform, PlatformError, RejectReason, VirtualClock};
use dispatcher::{
    AttemptContext, AuditWriter, Connector, ConnectorStatus, Dispatcher, MemoryAuditSink,
    PlatformAck, PlatformSettings, ScriptedConnector, Step,
};
use event_log::{AuditOutcome, BidAuditRecord, EventRecord, JsonlEventLog};
use resilience::BreakerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn setup(platform: Platform, default: Step) -> (Dispatcher, Arc<ScriptedConnector>, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new(1_000_000));
    let conn = Arc::new(ScriptedConnector::new(platform, default));
    let settings = PlatformSettings::new(platform, 1_000.0, Duration::from_secs(600));
    let d = Dispatcher::new(settings, conn.clone(), clock.clone()).unwrap();
    (d, conn, clock)
}

fn bid(platform: Platform) -> BidRequest {
    BidRequest::new("cust", "camp", platform, 100.0, 10.0)
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_three_times_then_fall_back() {
    let (d, conn, _) = setup(Platform::Amazon, Step::fail(PlatformError::ConnectionRefused));
    let audit = Arc::new(MemoryAuditSink::new());
    let d = d.with_audit(audit.clone());

    let started = Instant::now();
    let resp = d.submit(&bid(Platform::Amazon)).await;
    let elapsed = started.elapsed();

    assert_eq!(conn.calls(), 4);
    assert_eq!(resp.source, Some(BidSource::Fallback));
    // three jittered backoffs: 100/200/400 ms, each within 25 %
    assert!(elapsed >= Duration::from_millis(525) && elapsed <= Duration::from_millis(875), "{elapsed:?}");
    let rec = &audit.records()[0];
    assert_eq!(rec.attempts, 4);
    assert_eq!(rec.breaker_state, "open");
}

#[tokio::test(start_paused = true)]
async fn permanent_error_skips_retries() {
    let (d, conn, _) = setup(Platform::Meta, Step::fail(PlatformError::from_status(422, "bad creative")));
    let resp = d.submit(&bid(Platform::Meta)).await;
    assert_eq!(conn.calls(), 1);
    assert_eq!(resp.source, Some(BidSource::Fallback));
    assert_eq!(d.breaker().snapshot().consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn declined_bid_releases_budget_and_counts_as_success() {
    let (d, _, _) = setup(Platform::X, Step::decline());
    let resp = d.submit(&bid(Platform::X)).await;
    assert!(!resp.accepted);
    assert_eq!(resp.source, Some(BidSource::Ai));
    assert_eq!(resp.rejection, Some(RejectReason::PlatformDeclined));
    assert!(resp.platform_reference_id.is_some());
    let stats = d.stats();
    assert_eq!(stats.budget.current_spend, 0.0);
    assert_eq!(stats.breaker.consecutive_failures, 0);
    assert_eq!(stats.rate.in_window, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_cancels_in_flight_call() {
    let (d, _, _) = setup(Platform::TikTok, Step::accept().after(Duration::from_secs(10)));
    let deadline = Instant::now() + Duration::from_millis(200);
    let resp = d.submit_with_deadline(&bid(Platform::TikTok), deadline).await;
    assert_eq!(resp.rejection, Some(RejectReason::Cancelled));
    let stats = d.stats();
    assert_eq!(stats.budget.entry_count, 0);
    assert_eq!(stats.rate.in_window, 1);
    assert_eq!(stats.breaker.consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn passed_deadline_touches_nothing() {
    let (d, conn, _) = setup(Platform::TikTok, Step::accept());
    let resp = d.submit_with_deadline(&bid(Platform::TikTok), Instant::now()).await;
    assert_eq!(resp.rejection, Some(RejectReason::Cancelled));
    assert_eq!(conn.calls(), 0);
    assert_eq!(d.stats().rate.in_window, 0);
}

#[tokio::test(start_paused = true)]
async fn validation_failure_mutates_nothing() {
    let (d, conn, _) = setup(Platform::LinkedIn, Step::accept());
    let mut bad = bid(Platform::LinkedIn);
    bad.customer_id = String::new();
    let resp = d.submit(&bad).await;
    assert_eq!(resp.rejection, Some(RejectReason::Validation));

    let mut nan = bid(Platform::LinkedIn);
    nan.proposed_bid_amount = f64::NAN;
    assert_eq!(d.submit(&nan).await.rejection, Some(RejectReason::Validation));

    let stats = d.stats();
    assert_eq!(conn.calls(), 0);
    assert_eq!(stats.budget.entry_count, 0);
    assert_eq!(stats.rate.in_window, 0);
    assert_eq!(stats.ltv_samples, 0);
    assert_eq!(stats.breaker.state, BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_bid_releases_its_reservation() {
    let clock = Arc::new(VirtualClock::new(0));
    let conn = Arc::new(ScriptedConnector::always_accept(Platform::GoogleAds));
    let mut settings = PlatformSettings::new(Platform::GoogleAds, 100.0, Duration::from_secs(600));
    settings.rate_limit.max_calls = 1;
    let d = Dispatcher::new(settings, conn, clock).unwrap();

    assert!(d.submit(&bid(Platform::GoogleAds)).await.accepted);
    let limited = d.submit(&bid(Platform::GoogleAds)).await;
    assert_eq!(limited.rejection, Some(RejectReason::RateLimited));
    let stats = d.budget().stats();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.current_spend, 10.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn audit_records_reach_the_jsonl_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
    let (sink, writer) = AuditWriter::spawn(log.clone(), 64);

    let clock = Arc::new(VirtualClock::new(42));
    let conn = Arc::new(ScriptedConnector::always_accept(Platform::Meta));
    let settings = PlatformSettings::new(Platform::Meta, 25.0, Duration::from_secs(600));
    let d = Dispatcher::new(settings, conn, clock).unwrap().with_audit(Arc::new(sink));

    d.submit(&bid(Platform::Meta)).await;
    d.submit(&bid(Platform::Meta)).await;
    d.submit(&bid(Platform::Meta)).await;
    drop(d);
    assert_eq!(writer.finish().await, 3);

    let recs: Vec<EventRecord<BidAuditRecord>> = log.read_all().unwrap();
    let outcomes: Vec<_> = recs.iter().map(|r| r.payload.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AuditOutcome::Accepted, AuditOutcome::Accepted, AuditOutcome::Rejected]
    );
    assert_eq!(recs[2].payload.label(), "budget_exceeded");
    assert!(recs.iter().all(|r| r.ts_ms == 42));
}

/// Accepts every bid, but virtual time jumps forward while the call is out.
struct SlowPlatform {
    clock: Arc<VirtualClock>,
    advance_ms: u64,
}

#[async_trait]
impl Connector for SlowPlatform {
    fn platform(&self) -> Platform {
        Platform::Meta
    }

    async fn connect(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn close(&self) {}

    fn status(&self) -> ConnectorStatus {
        ConnectorStatus::Connected
    }

    async fn attempt(&self, amount: f64, ctx: &AttemptContext) -> Result<PlatformAck, PlatformError> {
        self.clock.advance_ms(self.advance_ms);
        Ok(PlatformAck {
            accepted: true,
            reference_id: format!("slow-{}", ctx.attempt),
            confirmed_amount: Some(amount),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn spend_booked_after_a_call_outlives_the_window_still_counts() {
    let clock = Arc::new(VirtualClock::new(10_000));
    let conn = Arc::new(SlowPlatform { clock: clock.clone(), advance_ms: 1_500 });
    let settings = PlatformSettings::new(Platform::Meta, 100.0, Duration::from_secs(1));
    let d = Dispatcher::new(settings, conn, clock.clone()).unwrap();

    let first = d.submit(&BidRequest::new("c", "k", Platform::Meta, 50.0, 100.0)).await;
    assert!(first.accepted);
    assert_eq!(first.amount, 100.0);
    assert_eq!(d.budget().stats().current_spend, 100.0);

    let second = d.submit(&BidRequest::new("c", "k", Platform::Meta, 50.0, 100.0)).await;
    assert_eq!(second.rejection, Some(RejectReason::BudgetExceeded));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_finite_bid_is_audited_without_breaking_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
    let (sink, writer) = AuditWriter::spawn(log.clone(), 64);

    let clock = Arc::new(VirtualClock::new(5));
    let conn = Arc::new(ScriptedConnector::always_accept(Platform::X));
    let settings = PlatformSettings::new(Platform::X, 100.0, Duration::from_secs(600));
    let d = Dispatcher::new(settings, conn, clock).unwrap().with_audit(Arc::new(sink));

    let mut nan = bid(Platform::X);
    nan.proposed_bid_amount = f64::NAN;
    assert_eq!(d.submit(&nan).await.rejection, Some(RejectReason::Validation));
    let mut inf = bid(Platform::X);
    inf.predicted_ltv = f64::NEG_INFINITY;
    assert_eq!(d.submit(&inf).await.rejection, Some(RejectReason::Validation));
    assert!(d.submit(&bid(Platform::X)).await.accepted);
    drop(d);
    assert_eq!(writer.finish().await, 3);

    let recs: Vec<EventRecord<BidAuditRecord>> = log.read_all().unwrap();
    assert_eq!(recs.len(), 3);
    assert_eq!(recs[0].payload.proposed_amount, None);
    assert_eq!(recs[1].payload.predicted_ltv, None);
    assert_eq!(recs[2].payload.proposed_amount, Some(10.0));
    assert_eq!(recs[2].payload.outcome, AuditOutcome::Accepted);
}
