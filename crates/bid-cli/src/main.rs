//! Audit log inspection and simulated load for the bid engine.

#![deny(unsafe_code)]

use bid_core::{BidRequest, Platform, SystemClock};
use clap::{Parser, Subcommand};
use dispatcher::config::PlatformSection;
use dispatcher::{
    AuditSink, AuditWriter, BidEngine, ConnectorSpec, DispatcherStats, EngineConfig,
    NoopAuditSink,
};
use event_log::{AuditOutcome, BidAuditRecord, EventRecord, JsonlEventLog};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry::{BidMetrics, FanoutMetrics, MetricsSink, MetricsSnapshot};
use tokio::task::JoinSet;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "bidguard", about = "Inspect bid audit logs and drive simulated bid load")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Totals by outcome, source and platform for an audit log
    Inspect {
        #[arg(short, long)]
        log: PathBuf,
        #[arg(short, long)]
        platform: Option<Platform>,
    },
    /// Print audit records with filters
    Replay {
        #[arg(short, long)]
        log: PathBuf,
        #[arg(short, long)]
        platform: Option<Platform>,
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
        #[arg(long, default_value_t = 0)]
        since_ts_ms: u64,
        #[arg(long, default_value_t = 0)]
        max: u64,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Drive one platform dispatcher with a simulated connector and print a summary
    Simulate {
        /// Engine YAML; falls back to BIDGUARD_CONFIG, then to a single-platform default
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        platform: Platform,
        #[arg(long, default_value_t = 100)]
        bids: u32,
        #[arg(long, default_value_t = 10.0)]
        amount: f64,
        #[arg(long, default_value_t = 100.0)]
        ltv: f64,
        #[arg(long, default_value_t = 8)]
        concurrency: u32,
        /// Budget used when no config file is given
        #[arg(long, default_value_t = 1_000.0)]
        budget: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Inspect { log, platform } => {
            let recs = load_records(&log, platform, 0, u64::MAX, 0, 0)?;
            println!("{}", serde_json::to_string_pretty(&summarize(&recs))?);
        }
        Command::Replay { log, platform, from, to, since_ts_ms, max, dry_run } => {
            let recs = load_records(&log, platform, from, to, since_ts_ms, max)?;
            cmd_replay(&log, &recs, dry_run);
        }
        Command::Simulate { config, platform, bids, amount, ltv, concurrency, budget, seed } => {
            telemetry::init_json_logging();
            #[cfg(feature = "otel")]
            if let Err(e) = telemetry::init_otel("bidguard") {
                eprintln!("otel tracing disabled: {e}");
            }
            let cfg = resolve_config(config.as_deref(), platform, budget)?;
            let opts = SimOptions { platform, bids, amount, ltv, concurrency, seed };
            let report = run_simulation(cfg, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn load_records(
    log: &Path,
    platform: Option<Platform>,
    from: u64,
    to: u64,
    since_ts_ms: u64,
    max: u64,
) -> CliResult<Vec<EventRecord<BidAuditRecord>>> {
    let log = JsonlEventLog::open(log)?;
    let mut recs: Vec<EventRecord<BidAuditRecord>> = log.read_range(from, to)?;
    if let Some(p) = platform {
        recs.retain(|rec| rec.payload.platform == p);
    }
    if since_ts_ms > 0 {
        recs.retain(|rec| rec.ts_ms >= since_ts_ms);
    }
    if max > 0 && recs.len() as u64 > max {
        recs.truncate(usize::try_from(max).unwrap_or(usize::MAX));
    }
    Ok(recs)
}

#[derive(Debug, Default, Serialize, PartialEq)]
struct LogSummary {
    total: usize,
    accepted: usize,
    rejected: usize,
    spend: f64,
    first_ts_ms: u64,
    last_ts_ms: u64,
    by_label: BTreeMap<String, usize>,
    by_platform: BTreeMap<String, usize>,
    spend_by_platform: BTreeMap<String, f64>,
}

fn summarize(recs: &[EventRecord<BidAuditRecord>]) -> LogSummary {
    let mut s = LogSummary {
        total: recs.len(),
        first_ts_ms: recs.first().map_or(0, |r| r.ts_ms),
        last_ts_ms: recs.last().map_or(0, |r| r.ts_ms),
        ..LogSummary::default()
    };
    for rec in recs {
        let p = &rec.payload;
        *s.by_label.entry(p.label().to_string()).or_default() += 1;
        *s.by_platform.entry(p.platform.to_string()).or_default() += 1;
        match p.outcome {
            AuditOutcome::Accepted => {
                s.accepted += 1;
                s.spend += p.final_amount;
                *s.spend_by_platform.entry(p.platform.to_string()).or_default() += p.final_amount;
            }
            AuditOutcome::Rejected => s.rejected += 1,
        }
    }
    s
}

fn cmd_replay(log: &Path, recs: &[EventRecord<BidAuditRecord>], dry_run: bool) {
    if dry_run {
        println!("records={}", recs.len());
        return;
    }
    println!("=== Replaying audit log: {} ===", log.display());
    for (idx, rec) in recs.iter().enumerate() {
        let p = &rec.payload;
        println!(
            "[{idx}] id={} ts={} platform={} {} amount={:.2} breaker={} attempts={} trace={}",
            rec.id,
            rec.ts_ms,
            p.platform,
            p.label(),
            p.final_amount,
            p.breaker_state,
            p.attempts,
            p.trace_id,
        );
    }
    println!("=== Replay complete ({}) ===", recs.len());
}

fn resolve_config(path: Option<&Path>, platform: Platform, budget: f64) -> CliResult<EngineConfig> {
    let cfg = match path {
        Some(p) => Some(EngineConfig::load(p)?),
        None => EngineConfig::from_env()?,
    };
    let cfg = match cfg {
        Some(c) => c,
        None => default_config(platform, budget)?,
    };
    if !cfg.platforms.iter().any(|s| s.platform == platform) {
        return Err(format!("platform {platform} is not configured").into());
    }
    Ok(cfg)
}

/// Single-platform config with reference defaults.
fn default_config(platform: Platform, budget: f64) -> CliResult<EngineConfig> {
    let mut c = EngineConfig {
        platforms: vec![PlatformSection {
            platform,
            max_budget: Some(budget),
            budget_window_secs: 24 * 60 * 60,
            rate_limit: None,
            multiplier: None,
        }],
        ..EngineConfig::default()
    };
    c.apply_env_overrides()?;
    c.validate()?;
    Ok(c)
}

#[derive(Debug, Clone)]
struct SimOptions {
    platform: Platform,
    bids: u32,
    amount: f64,
    ltv: f64,
    concurrency: u32,
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SimReport {
    platform: Platform,
    bids: u32,
    elapsed_ms: u64,
    metrics: MetricsSnapshot,
    dispatcher: Option<DispatcherStats>,
    audit_written: Option<u64>,
    audit_dropped: u64,
}

/// Local counters for the report, plus OTLP export when built with `otel`.
fn outcome_sink(metrics: &BidMetrics) -> Arc<dyn MetricsSink> {
    let fan = FanoutMetrics::new().with(Arc::new(metrics.clone()));
    #[cfg(feature = "otel")]
    let fan = fan.with(Arc::new(telemetry::otel_metrics::OtelBidMetrics::global()));
    Arc::new(fan)
}

async fn run_simulation(mut cfg: EngineConfig, opts: &SimOptions) -> CliResult<SimReport> {
    if let Some(seed) = opts.seed {
        let ConnectorSpec::Simulated(s) = &mut cfg.connector;
        s.seed = Some(seed);
    }
    let metrics = BidMetrics::new();
    let mut writer = None;
    let audit: Arc<dyn AuditSink> = match &cfg.audit {
        Some(a) => {
            let log = JsonlEventLog::open(&a.path)?;
            let (sink, w) = AuditWriter::spawn(log, a.channel_capacity);
            writer = Some((sink.clone(), w));
            Arc::new(sink)
        }
        None => Arc::new(NoopAuditSink),
    };
    let engine =
        BidEngine::from_config_default(&cfg, Arc::new(SystemClock), outcome_sink(&metrics), audit)?;
    for (p, e) in engine.connect_all().await {
        eprintln!("connect {p} failed: {e}");
    }

    let started = std::time::Instant::now();
    let workers = opts.concurrency.clamp(1, opts.bids.max(1));
    let mut tasks = JoinSet::new();
    for w in 0..workers {
        let engine = engine.clone();
        let opts = opts.clone();
        // spread bids evenly; the first workers take the remainder
        let share = opts.bids / workers + u32::from(w < opts.bids % workers);
        tasks.spawn(async move {
            for i in 0..share {
                let req = BidRequest::new(
                    format!("sim-customer-{w}"),
                    format!("sim-campaign-{i}"),
                    opts.platform,
                    opts.ltv,
                    opts.amount,
                );
                engine.submit(&req).await;
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined?;
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    engine.close_all().await;
    let dispatcher = engine.dispatcher(opts.platform).map(|d| d.stats());
    drop(engine);
    let (audit_written, audit_dropped) = match writer {
        Some((sink, writer)) => {
            let dropped = sink.dropped();
            drop(sink);
            (Some(writer.finish().await), dropped)
        }
        None => (None, 0),
    };
    Ok(SimReport {
        platform: opts.platform,
        bids: opts.bids,
        elapsed_ms,
        metrics: metrics.snapshot(),
        dispatcher,
        audit_written,
        audit_dropped,
    })
}
