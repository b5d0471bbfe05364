//! Structured logging setup and best-effort bid outcome metrics.

#![deny(unsafe_code)]

use bid_core::{BidSource, Platform, RejectReason};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[cfg(feature = "otel")]
pub mod otel_metrics;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,dispatcher=debug". Lines go to stderr so stdout stays
/// free for command output.
pub fn init_json_logging() {
    let fmt_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Initialize OpenTelemetry tracer (optional; behind `otel` feature). No tracing subscriber hookup.
#[cfg(feature = "otel")]
pub fn init_otel(service_name: &str) -> Result<(), TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace as sdktrace;
    use opentelemetry_sdk::{runtime, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_owned())]);
    let _tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    Ok(())
}

/// One terminal bid outcome as seen by metrics.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeEvent<'a> {
    pub platform: Platform,
    pub accepted: bool,
    pub source: Option<BidSource>,
    pub reason: Option<RejectReason>,
    pub breaker_state: &'a str,
    pub latency: Duration,
    pub amount: f64,
    pub attempts: u32,
}

impl OutcomeEvent<'_> {
    pub fn fallback_used(&self) -> bool {
        self.source == Some(BidSource::Fallback)
    }
}

/// Receives bid outcomes. Implementations must not block or fail the caller.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &OutcomeEvent<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: &OutcomeEvent<'_>) {}
}

const REASONS: [RejectReason; 6] = [
    RejectReason::Validation,
    RejectReason::BudgetExceeded,
    RejectReason::RateLimited,
    RejectReason::Cancelled,
    RejectReason::PlatformDeclined,
    RejectReason::NoFallbackBid,
];

fn reason_index(r: RejectReason) -> usize {
    match r {
        RejectReason::Validation => 0,
        RejectReason::BudgetExceeded => 1,
        RejectReason::RateLimited => 2,
        RejectReason::Cancelled => 3,
        RejectReason::PlatformDeclined => 4,
        RejectReason::NoFallbackBid => 5,
    }
}

#[derive(Default)]
struct Counters {
    outcomes: AtomicU64,
    accepted: AtomicU64,
    ai: AtomicU64,
    fallback: AtomicU64,
    rejected: [AtomicU64; 6],
    spend_micros: AtomicU64,
    latency_ms_total: AtomicU64,
    attempts: AtomicU64,
}

/// In-process atomic counters. Cheap to clone; clones share the counters.
#[derive(Clone, Default)]
pub struct BidMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub outcomes: u64,
    pub accepted: u64,
    pub ai: u64,
    pub fallback: u64,
    pub rejected: Vec<(RejectReason, u64)>,
    pub spend: f64,
    pub latency_ms_total: u64,
    pub attempts: u64,
}

impl MetricsSnapshot {
    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        self.rejected.iter().find(|(r, _)| *r == reason).map_or(0, |(_, n)| *n)
    }
}

impl BidMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner;
        MetricsSnapshot {
            outcomes: c.outcomes.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            ai: c.ai.load(Ordering::Relaxed),
            fallback: c.fallback.load(Ordering::Relaxed),
            rejected: REASONS
                .iter()
                .map(|r| (*r, c.rejected[reason_index(*r)].load(Ordering::Relaxed)))
                .collect(),
            spend: bid_core::money::from_micros(c.spend_micros.load(Ordering::Relaxed)),
            latency_ms_total: c.latency_ms_total.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for BidMetrics {
    fn record(&self, e: &OutcomeEvent<'_>) {
        let c = &self.inner;
        c.outcomes.fetch_add(1, Ordering::Relaxed);
        if e.accepted {
            c.accepted.fetch_add(1, Ordering::Relaxed);
        }
        match e.source {
            Some(BidSource::Ai) => {
                c.ai.fetch_add(1, Ordering::Relaxed);
            }
            Some(BidSource::Fallback) => {
                c.fallback.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
        if let Some(r) = e.reason {
            c.rejected[reason_index(r)].fetch_add(1, Ordering::Relaxed);
        }
        let micros = bid_core::money::to_micros(e.amount);
        if micros > 0 {
            c.spend_micros.fetch_add(micros, Ordering::Relaxed);
        }
        let ms = u64::try_from(e.latency.as_millis()).unwrap_or(u64::MAX);
        c.latency_ms_total.fetch_add(ms, Ordering::Relaxed);
        c.attempts.fetch_add(u64::from(e.attempts), Ordering::Relaxed);
    }
}

/// Fan out to several sinks.
#[derive(Clone, Default)]
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutMetrics {
    fn record(&self, event: &OutcomeEvent<'_>) {
        for s in &self.sinks {
            s.record(event);
        }
    }
}
