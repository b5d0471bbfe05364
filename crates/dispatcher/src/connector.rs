//! Platform call interface.
//!
//! The pipeline only ever talks to `dyn Connector`. Concrete wire formats for each ad
//! network live outside this workspace; what ships here is a seeded simulator for load
//! runs and a scripted connector for tests. [`build`] is the single factory.

use async_trait::async_trait;
use bid_core::{ConfigError, Platform, PlatformError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

/// Platform answer to one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformAck {
    /// False when the platform processed the request but did not take the bid.
    pub accepted: bool,
    pub reference_id: String,
    /// Amount the platform actually booked, if it reports one.
    pub confirmed_amount: Option<f64>,
}

/// Per-attempt data handed to the connector.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub trace_id: String,
    pub customer_id: String,
    pub campaign_id: String,
    /// 1-based attempt number within the retry loop.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Disconnected,
    Connected,
    Closed,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> Platform;

    async fn connect(&self) -> Result<(), PlatformError>;

    async fn close(&self);

    fn status(&self) -> ConnectorStatus;

    /// One platform call. The caller bounds it with the per-attempt timeout.
    async fn attempt(&self, amount: f64, ctx: &AttemptContext)
        -> Result<PlatformAck, PlatformError>;
}

struct StatusCell(Mutex<ConnectorStatus>);

impl StatusCell {
    fn new() -> Self {
        Self(Mutex::new(ConnectorStatus::Disconnected))
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorStatus> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self) -> ConnectorStatus {
        *self.lock()
    }

    fn set(&self, s: ConnectorStatus) {
        *self.lock() = s;
    }
}

fn closed_error(platform: Platform) -> PlatformError {
    PlatformError::Unavailable(format!("{platform} connector closed"))
}

/// Tunables for [`SimulatedConnector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatedSettings {
    pub latency_ms: u64,
    /// Uniform extra latency in `[0, latency_jitter_ms]`.
    pub latency_jitter_ms: u64,
    pub transient_failure_rate: f64,
    pub permanent_failure_rate: f64,
    pub decline_rate: f64,
    /// Fixed seed for reproducible runs; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            latency_jitter_ms: 10,
            transient_failure_rate: 0.05,
            permanent_failure_rate: 0.01,
            decline_rate: 0.02,
            seed: None,
        }
    }
}

impl SimulatedSettings {
    /// Each rate must lie in `[0, 1]` and together they must not exceed 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = [
            ("connector.transient_failure_rate", self.transient_failure_rate),
            ("connector.permanent_failure_rate", self.permanent_failure_rate),
            ("connector.decline_rate", self.decline_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::invalid(name, format!("must be in [0, 1] (got {rate})")));
            }
        }
        let total: f64 = rates.iter().map(|(_, r)| r).sum();
        if total > 1.0 {
            return Err(ConfigError::invalid("connector", format!("rates sum to {total}, above 1")));
        }
        Ok(())
    }
}

enum Draw {
    Accept,
    Decline,
    Transient,
    Permanent,
}

/// Connector that fakes a platform with configurable latency and failure rates.
pub struct SimulatedConnector {
    platform: Platform,
    settings: SimulatedSettings,
    rng: Mutex<StdRng>,
    status: StatusCell,
    next_ref: AtomicU64,
}

impl std::fmt::Debug for SimulatedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedConnector")
            .field("platform", &self.platform)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SimulatedConnector {
    pub fn new(platform: Platform, settings: SimulatedSettings) -> Self {
        let rng = match settings.seed {
            // Mix in the platform so one seed gives each platform its own stream.
            Some(seed) => StdRng::seed_from_u64(seed ^ ((platform as u64 + 1) << 32)),
            None => StdRng::from_entropy(),
        };
        Self {
            platform,
            settings,
            rng: Mutex::new(rng),
            status: StatusCell::new(),
            next_ref: AtomicU64::new(1),
        }
    }

    fn draw(&self) -> (Duration, Draw) {
        let s = &self.settings;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let extra = if s.latency_jitter_ms > 0 { rng.gen_range(0..=s.latency_jitter_ms) } else { 0 };
        let roll: f64 = rng.gen();
        let draw = if roll < s.transient_failure_rate {
            Draw::Transient
        } else if roll < s.transient_failure_rate + s.permanent_failure_rate {
            Draw::Permanent
        } else if roll < s.transient_failure_rate + s.permanent_failure_rate + s.decline_rate {
            Draw::Decline
        } else {
            Draw::Accept
        };
        (Duration::from_millis(s.latency_ms.saturating_add(extra)), draw)
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn connect(&self) -> Result<(), PlatformError> {
        self.status.set(ConnectorStatus::Connected);
        Ok(())
    }

    async fn close(&self) {
        self.status.set(ConnectorStatus::Closed);
    }

    fn status(&self) -> ConnectorStatus {
        self.status.get()
    }

    async fn attempt(
        &self,
        amount: f64,
        _ctx: &AttemptContext,
    ) -> Result<PlatformAck, PlatformError> {
        if self.status.get() == ConnectorStatus::Closed {
            return Err(closed_error(self.platform));
        }
        let (latency, draw) = self.draw();
        sleep(latency).await;
        let reference_id =
            format!("{}-{:08x}", self.platform.as_str(), self.next_ref.fetch_add(1, Ordering::Relaxed));
        match draw {
            Draw::Accept => {
                Ok(PlatformAck { accepted: true, reference_id, confirmed_amount: Some(amount) })
            }
            Draw::Decline => Ok(PlatformAck { accepted: false, reference_id, confirmed_amount: None }),
            Draw::Transient => Err(PlatformError::from_status(503, "simulated overload")),
            Draw::Permanent => Err(PlatformError::from_status(400, "simulated rejection")),
        }
    }
}

/// What a [`ScriptedConnector`] does on one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Accept; `None` books the requested amount.
    Accept(Option<f64>),
    Decline,
    Fail(PlatformError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub delay: Duration,
    pub outcome: StepOutcome,
}

impl Step {
    pub fn accept() -> Self {
        Self { delay: Duration::ZERO, outcome: StepOutcome::Accept(None) }
    }

    pub fn accept_at(amount: f64) -> Self {
        Self { delay: Duration::ZERO, outcome: StepOutcome::Accept(Some(amount)) }
    }

    pub fn decline() -> Self {
        Self { delay: Duration::ZERO, outcome: StepOutcome::Decline }
    }

    pub fn fail(err: PlatformError) -> Self {
        Self { delay: Duration::ZERO, outcome: StepOutcome::Fail(err) }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Plays queued steps in order, then repeats a default step forever.
pub struct ScriptedConnector {
    platform: Platform,
    queue: Mutex<VecDeque<Step>>,
    default: Mutex<Step>,
    calls: AtomicU32,
    status: StatusCell,
}

impl std::fmt::Debug for ScriptedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedConnector")
            .field("platform", &self.platform)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl ScriptedConnector {
    pub fn new(platform: Platform, default: Step) -> Self {
        Self {
            platform,
            queue: Mutex::new(VecDeque::new()),
            default: Mutex::new(default),
            calls: AtomicU32::new(0),
            status: StatusCell::new(),
        }
    }

    /// Connector that accepts every bid immediately.
    pub fn always_accept(platform: Platform) -> Self {
        Self::new(platform, Step::accept())
    }

    pub fn then(self, step: Step) -> Self {
        self.push(step);
        self
    }

    pub fn push(&self, step: Step) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(step);
    }

    /// Replace the step used once the queue is empty.
    pub fn set_default(&self, step: Step) {
        *self.default.lock().unwrap_or_else(PoisonError::into_inner) = step;
    }

    /// Attempts received so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let queued = self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        queued.unwrap_or_else(|| self.default.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn connect(&self) -> Result<(), PlatformError> {
        self.status.set(ConnectorStatus::Connected);
        Ok(())
    }

    async fn close(&self) {
        self.status.set(ConnectorStatus::Closed);
    }

    fn status(&self) -> ConnectorStatus {
        self.status.get()
    }

    async fn attempt(
        &self,
        amount: f64,
        ctx: &AttemptContext,
    ) -> Result<PlatformAck, PlatformError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.status.get() == ConnectorStatus::Closed {
            return Err(closed_error(self.platform));
        }
        let step = self.next_step();
        if !step.delay.is_zero() {
            sleep(step.delay).await;
        }
        let reference_id = format!("{}-{}-{n}", self.platform.as_str(), ctx.attempt);
        match step.outcome {
            StepOutcome::Accept(confirmed) => Ok(PlatformAck {
                accepted: true,
                reference_id,
                confirmed_amount: Some(confirmed.unwrap_or(amount)),
            }),
            StepOutcome::Decline => {
                Ok(PlatformAck { accepted: false, reference_id, confirmed_amount: None })
            }
            StepOutcome::Fail(e) => Err(e),
        }
    }
}

/// Connector selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorSpec {
    Simulated(SimulatedSettings),
}

impl ConnectorSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Simulated(s) => s.validate(),
        }
    }
}

impl Default for ConnectorSpec {
    fn default() -> Self {
        Self::Simulated(SimulatedSettings::default())
    }
}

/// Build the connector for `platform`.
pub fn build(platform: Platform, spec: &ConnectorSpec) -> Arc<dyn Connector> {
    match spec {
        ConnectorSpec::Simulated(s) => Arc::new(SimulatedConnector::new(platform, s.clone())),
    }
}
