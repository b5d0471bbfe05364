//! Per-platform admission pipeline.
//!
//! ```text
//! validate -> reserve budget -> rate check -> breaker gate
//!    breaker closed/probe: acquire rate slot -> retried platform call
//!       placed   -> confirm reservation at the booked amount (source=ai)
//!       declined -> release reservation (source=ai, rejected)
//!       failed   -> fallback
//!    breaker open: fallback (no rate slot consumed)
//! fallback: estimate from LTV history -> confirm reservation at the estimate
//!    estimate not positive -> release reservation (rejected)
//! ```
//!
//! Every terminal response is reported to the metrics and audit sinks. Neither can block
//! or fail the bid.

use crate::config::PlatformSettings;
use crate::connector::{AttemptContext, Connector, PlatformAck};
use crate::sinks::{AuditSink, NoopAuditSink};
use bid_core::{
    BidRequest, BidResponse, Clock, ConfigError, Platform, PlatformError, RejectReason,
    ValidationError,
};
use budget::{BudgetLedger, BudgetState, BudgetStats, Reservation};
use event_log::BidAuditRecord;
use fallback::{HeuristicFallback, LtvHistory};
use resilience::{
    BreakerSnapshot, BreakerState, CircuitBreaker, RateLimitStats, RateLimiter, RetryPolicy,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use telemetry::{MetricsSink, NoopMetrics, OutcomeEvent};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Point-in-time view of one dispatcher's state objects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherStats {
    pub platform: Platform,
    pub budget: BudgetStats,
    pub rate: RateLimitStats,
    pub breaker: BreakerSnapshot,
    pub ltv_samples: usize,
}

enum CallOutcome {
    Placed(PlatformAck),
    Failed(PlatformError),
    Expired,
}

/// Decision pipeline for one platform, shared by every caller through `Arc`.
pub struct Dispatcher {
    platform: Platform,
    settings: PlatformSettings,
    budget: BudgetLedger,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    history: LtvHistory,
    retry: RetryPolicy,
    fallback: HeuristicFallback,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    audit: Arc<dyn AuditSink>,
    budget_state: Mutex<BudgetState>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("platform", &self.platform)
            .field("budget", &self.budget)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        settings: PlatformSettings,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let platform = settings.platform;
        if connector.platform() != platform {
            return Err(ConfigError::invalid(
                "connector",
                format!("{} connector given to the {platform} dispatcher", connector.platform()),
            ));
        }
        Ok(Self {
            platform,
            budget: BudgetLedger::new(&settings.budget, Arc::clone(&clock))?,
            limiter: RateLimiter::new(settings.rate_limit, Arc::clone(&clock))?,
            breaker: CircuitBreaker::new(platform.as_str(), settings.breaker, Arc::clone(&clock)),
            history: LtvHistory::with_capacity(settings.history_capacity)?,
            retry: RetryPolicy::new(settings.retry)?,
            fallback: HeuristicFallback::new(settings.fallback)?,
            settings,
            connector,
            clock,
            metrics: Arc::new(NoopMetrics),
            audit: Arc::new(NoopAuditSink),
            budget_state: Mutex::new(BudgetState::Within),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn settings(&self) -> &PlatformSettings {
        &self.settings
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn budget(&self) -> &BudgetLedger {
        &self.budget
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn ltv_history(&self) -> &LtvHistory {
        &self.history
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            platform: self.platform,
            budget: self.budget.stats(),
            rate: self.limiter.stats(),
            breaker: self.breaker.snapshot(),
            ltv_samples: self.history.len(),
        }
    }

    /// Run one bid through the pipeline. Never fails; every outcome is a response.
    #[instrument(skip_all, fields(platform = %self.platform, trace_id = %req.trace_id))]
    pub async fn submit(&self, req: &BidRequest) -> BidResponse {
        self.process(req, None).await
    }

    /// Like [`submit`](Self::submit), but gives up at `deadline`. An expired bid releases
    /// its budget, keeps its rate-limit slot, counts one breaker failure if an attempt
    /// was in flight, and is rejected as `Cancelled`.
    #[instrument(skip_all, fields(platform = %self.platform, trace_id = %req.trace_id))]
    pub async fn submit_with_deadline(&self, req: &BidRequest, deadline: Instant) -> BidResponse {
        self.process(req, Some(deadline)).await
    }

    async fn process(&self, req: &BidRequest, deadline: Option<Instant>) -> BidResponse {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let resp = self.decide(req, deadline, &attempts).await;
        self.emit(req, &resp, attempts.load(Ordering::SeqCst), started.elapsed());
        resp
    }

    fn validate(&self, req: &BidRequest) -> Result<(), ValidationError> {
        if req.platform != self.platform {
            return Err(ValidationError::PlatformMismatch {
                expected: self.platform.to_string(),
                got: req.platform.to_string(),
            });
        }
        req.validate()
    }

    fn reject(&self, reason: RejectReason, message: impl Into<String>) -> BidResponse {
        BidResponse::rejected(reason, message, self.clock.now_ms())
    }

    async fn decide(
        &self,
        req: &BidRequest,
        deadline: Option<Instant>,
        attempts: &AtomicU32,
    ) -> BidResponse {
        if let Err(e) = self.validate(req) {
            debug!(error = %e, "bid failed validation");
            return self.reject(RejectReason::Validation, e.to_string());
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return self.reject(RejectReason::Cancelled, "deadline passed before admission");
        }

        let reservation = {
            let _span = info_span!("bid.budget.check", amount = req.proposed_bid_amount).entered();
            match self.budget.try_reserve(req.proposed_bid_amount) {
                Some(r) => r,
                None => {
                    debug!(remaining = self.budget.stats().remaining, "budget exhausted");
                    return self.reject(
                        RejectReason::BudgetExceeded,
                        format!("{} budget exhausted for the current window", self.platform),
                    );
                }
            }
        };

        {
            let _span = info_span!("bid.rate.check").entered();
            if !self.limiter.can_make_call() {
                reservation.release();
                return self.reject(RejectReason::RateLimited, "platform rate limit reached");
            }
        }

        let admitted = {
            let _span = info_span!("bid.breaker.check").entered();
            let ok = self.breaker.can_execute();
            if !ok {
                debug!(state = self.breaker.state().as_str(), "breaker refused call");
            }
            ok
        };
        if !admitted {
            return self.use_fallback(req, reservation, "circuit open");
        }

        if !self.limiter.try_acquire() {
            self.breaker.cancel_probe();
            reservation.release();
            return self.reject(RejectReason::RateLimited, "platform rate limit reached");
        }

        match self.call_platform(req, deadline, attempts).await {
            CallOutcome::Placed(ack) if ack.accepted => {
                let booked = ack.confirmed_amount.unwrap_or(req.proposed_bid_amount);
                self.history.observe(req.predicted_ltv);
                let settled = reservation.confirm(booked);
                self.after_settlement(settled.capped, booked, settled.recorded);
                BidResponse::ai(ack.reference_id, settled.recorded, self.clock.now_ms())
            }
            CallOutcome::Placed(ack) => {
                self.history.observe(req.predicted_ltv);
                reservation.release();
                BidResponse::declined(ack.reference_id, self.clock.now_ms())
            }
            CallOutcome::Failed(e) => {
                let why = format!("platform call failed ({})", e.kind());
                self.use_fallback(req, reservation, &why)
            }
            CallOutcome::Expired => {
                self.history.observe(req.predicted_ltv);
                reservation.release();
                warn!(attempts = attempts.load(Ordering::SeqCst), "bid deadline expired");
                self.reject(RejectReason::Cancelled, "deadline expired during platform call")
            }
        }
    }

    async fn call_platform(
        &self,
        req: &BidRequest,
        deadline: Option<Instant>,
        attempts: &AtomicU32,
    ) -> CallOutcome {
        let in_flight = AtomicBool::new(false);
        let started = Instant::now();
        let amount = req.proposed_bid_amount;
        let run = self.retry.run(
            |attempt| {
                in_flight.store(true, Ordering::SeqCst);
                attempts.store(attempt, Ordering::SeqCst);
                let connector = Arc::clone(&self.connector);
                let ctx = AttemptContext {
                    trace_id: req.trace_id.clone(),
                    customer_id: req.customer_id.clone(),
                    campaign_id: req.campaign_id.clone(),
                    attempt,
                };
                let span = info_span!("bid.platform.attempt", attempt);
                async move { connector.attempt(amount, &ctx).await }.instrument(span)
            },
            |report| {
                in_flight.store(false, Ordering::SeqCst);
                self.breaker.record_result(report.succeeded(), report.latency);
                if let Some(e) = &report.error {
                    debug!(attempt = report.attempt, error = %e, "platform attempt failed");
                }
            },
        );
        let outcome = match deadline {
            None => run.await,
            Some(d) => match timeout_at(d, run).await {
                Ok(o) => o,
                Err(_) => {
                    if in_flight.load(Ordering::SeqCst) {
                        self.breaker.record_result(false, started.elapsed());
                    }
                    return CallOutcome::Expired;
                }
            },
        };
        match outcome.result {
            Ok(ack) => CallOutcome::Placed(ack),
            Err(e) => CallOutcome::Failed(e),
        }
    }

    fn use_fallback(&self, req: &BidRequest, reservation: Reservation<'_>, why: &str) -> BidResponse {
        let _span = info_span!("bid.fallback", reason = why).entered();
        let est = self.fallback.estimate(&self.history, self.settings.multiplier);
        self.history.observe(req.predicted_ltv);
        if !est.is_biddable() {
            reservation.release();
            debug!(amount = est.amount, samples = est.samples, "fallback estimate not biddable");
            return self.reject(
                RejectReason::NoFallbackBid,
                format!("fallback estimate {:.2} is not a positive bid: {why}", est.amount),
            );
        }
        let settled = reservation.confirm(est.amount);
        self.after_settlement(settled.capped, est.amount, settled.recorded);
        let message = if est.used_baseline() {
            format!("fallback baseline bid: {why}")
        } else {
            format!("fallback bid from {} LTV samples: {why}", est.samples)
        };
        BidResponse::fallback(settled.recorded, message, self.clock.now_ms())
    }

    fn after_settlement(&self, capped: bool, wanted: f64, recorded: f64) {
        if capped {
            warn!(wanted, recorded, "settled amount capped to stay within budget");
        }
        let state = self.budget.stats().state;
        let mut last = self.budget_state.lock().unwrap_or_else(PoisonError::into_inner);
        if state != *last {
            match state {
                BudgetState::Within => {}
                BudgetState::Warning80 | BudgetState::Warning90 | BudgetState::Exceeded => {
                    warn!(?state, "budget utilization threshold crossed");
                }
            }
            *last = state;
        }
    }

    fn emit(&self, req: &BidRequest, resp: &BidResponse, attempts: u32, latency: Duration) {
        let breaker_state = self.breaker.state();
        self.metrics.record(&OutcomeEvent {
            platform: self.platform,
            accepted: resp.accepted,
            source: resp.source,
            reason: resp.rejection,
            breaker_state: breaker_state.as_str(),
            latency,
            amount: resp.amount,
            attempts,
        });
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.audit.submit(BidAuditRecord::from_outcome(
            req,
            resp,
            breaker_state.as_str(),
            attempts,
            latency_ms,
        ));
        if breaker_state != BreakerState::Closed || !resp.accepted {
            info!(
                accepted = resp.accepted,
                source = resp.source.map(|s| s.as_str()),
                reason = resp.rejection.map(|r| r.as_str()),
                breaker = breaker_state.as_str(),
                amount = resp.amount,
                "bid finalized"
            );
        } else {
            debug!(amount = resp.amount, attempts, "bid finalized");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ScriptedConnector, Step};
    use bid_core::VirtualClock;
    use telemetry::BidMetrics;

    fn dispatcher(
        platform: Platform,
        max_budget: f64,
        connector: Arc<ScriptedConnector>,
    ) -> (Dispatcher, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let settings = PlatformSettings::new(platform, max_budget, Duration::from_secs(600));
        (Dispatcher::new(settings, connector, clock.clone()).unwrap(), clock)
    }

    fn bid(platform: Platform, amount: f64) -> BidRequest {
        BidRequest::new("cust-1", "camp-1", platform, 120.0, amount)
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_bid_books_confirmed_amount() {
        let conn = Arc::new(ScriptedConnector::new(Platform::Meta, Step::accept_at(8.0)));
        let (d, _) = dispatcher(Platform::Meta, 100.0, conn);
        let resp = d.submit(&bid(Platform::Meta, 10.0)).await;
        assert!(resp.accepted);
        assert_eq!(resp.amount, 8.0);
        assert_eq!(d.budget().stats().current_spend, 8.0);
        assert_eq!(d.ltv_history().len(), 1);
        assert_eq!(d.rate_limiter().stats().in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connector_for_other_platform_is_rejected() {
        let conn = Arc::new(ScriptedConnector::always_accept(Platform::X));
        let clock = Arc::new(VirtualClock::new(0));
        let settings = PlatformSettings::new(Platform::Meta, 10.0, Duration::from_secs(60));
        assert!(Dispatcher::new(settings, conn, clock).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_platform_is_a_validation_error() {
        let conn = Arc::new(ScriptedConnector::always_accept(Platform::Meta));
        let (d, _) = dispatcher(Platform::Meta, 100.0, conn.clone());
        let resp = d.submit(&bid(Platform::TikTok, 10.0)).await;
        assert_eq!(resp.rejection, Some(RejectReason::Validation));
        assert_eq!(conn.calls(), 0);
        assert_eq!(d.stats().budget.entry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_see_every_outcome() {
        let conn = Arc::new(ScriptedConnector::always_accept(Platform::Amazon));
        let metrics = BidMetrics::new();
        let (d, _) = dispatcher(Platform::Amazon, 20.0, conn);
        let d = d.with_metrics(Arc::new(metrics.clone()));
        d.submit(&bid(Platform::Amazon, 15.0)).await;
        d.submit(&bid(Platform::Amazon, 15.0)).await;
        let s = metrics.snapshot();
        assert_eq!(s.outcomes, 2);
        assert_eq!(s.ai, 1);
        assert_eq!(s.rejected_for(RejectReason::BudgetExceeded), 1);
        assert_eq!(s.spend, 15.0);
    }

    #[tokio::test(start_paused = true)]
    async fn growth_past_budget_is_capped() {
        let conn = Arc::new(ScriptedConnector::new(Platform::GoogleAds, Step::accept_at(30.0)));
        let (d, _) = dispatcher(Platform::GoogleAds, 25.0, conn);
        let resp = d.submit(&bid(Platform::GoogleAds, 20.0)).await;
        assert!(resp.accepted);
        assert_eq!(resp.amount, 20.0);
        assert!(d.budget().stats().current_spend <= 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_value_fallback_is_rejected_not_placed() {
        let conn = Arc::new(ScriptedConnector::new(
            Platform::Meta,
            Step::fail(PlatformError::from_status(400, "bad creative")),
        ));
        let (d, _) = dispatcher(Platform::Meta, 100.0, conn);
        let zero_ltv = BidRequest::new("cust-1", "camp-1", Platform::Meta, 0.0, 10.0);

        // empty history: baseline bid
        let first = d.submit(&zero_ltv).await;
        assert!(first.accepted);
        assert_eq!(first.amount, 5.0);

        // history is all zeros now
        let second = d.submit(&zero_ltv).await;
        assert!(!second.accepted);
        assert_eq!(second.rejection, Some(RejectReason::NoFallbackBid));
        let stats = d.budget().stats();
        assert_eq!(stats.current_spend, 5.0);
        assert_eq!(stats.entry_count, 1);
    }
}
