//! OTel metrics (OTLP) for bid outcomes.
#![allow(clippy::module_name_repetitions)]

use crate::{MetricsSink, OutcomeEvent, TelemetryError};
use once_cell::sync::OnceCell;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
use opentelemetry::KeyValue;

static METRICS_INIT: OnceCell<()> = OnceCell::new();
static INSTR: OnceCell<Instruments> = OnceCell::new();

struct Instruments {
    outcomes: Counter<u64>,
    spend_micros: Counter<u64>,
    latency_ms: Histogram<u64>,
    attempts: Histogram<u64>,
}

fn init_metrics_from_env() -> Result<(), TelemetryError> {
    // Exporter endpoint comes from OTEL_EXPORTER_* env vars.
    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(opentelemetry_sdk::runtime::Tokio)
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .build()
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    global::set_meter_provider(provider);
    Ok(())
}

fn ensure_instruments() -> &'static Instruments {
    let _ = METRICS_INIT.get_or_init(|| {
        if let Err(e) = init_metrics_from_env() {
            tracing::warn!(error = %e, "otel metrics disabled");
        }
    });
    INSTR.get_or_init(|| {
        let meter: Meter = global::meter("bidguard");
        Instruments {
            outcomes: meter
                .u64_counter("bid.outcome.count")
                .with_description("Terminal bid outcomes by platform, source and reason")
                .init(),
            spend_micros: meter
                .u64_counter("bid.spend.total_micros")
                .with_description("Accepted bid amount (micros)")
                .with_unit(Unit::new("us"))
                .init(),
            latency_ms: meter
                .u64_histogram("bid.latency")
                .with_description("End-to-end submit latency")
                .with_unit(Unit::new("ms"))
                .init(),
            attempts: meter
                .u64_histogram("bid.platform.attempts")
                .with_description("Platform attempts per bid")
                .init(),
        }
    })
}

/// OTel-backed metrics sink. Uses the global meter provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelBidMetrics;

impl OtelBidMetrics {
    pub fn global() -> Self {
        let _ = ensure_instruments();
        Self
    }
}

impl MetricsSink for OtelBidMetrics {
    fn record(&self, e: &OutcomeEvent<'_>) {
        let inst = ensure_instruments();
        let attrs = [
            KeyValue::new("platform", e.platform.as_str()),
            KeyValue::new("source", e.source.map_or("none", |s| s.as_str())),
            KeyValue::new("reason", e.reason.map_or("none", |r| r.as_str())),
            KeyValue::new("breaker_state", e.breaker_state.to_string()),
        ];
        inst.outcomes.add(1, &attrs);
        let micros = bid_core::money::to_micros(e.amount);
        if micros > 0 {
            inst.spend_micros.add(micros, &attrs[..2]);
        }
        let ms = u64::try_from(e.latency.as_millis()).unwrap_or(u64::MAX);
        inst.latency_ms.record(ms, &attrs[..1]);
        inst.attempts.record(u64::from(e.attempts), &attrs[..1]);
    }
}
