//! Bounded exponential backoff with jitter around one logical platform call.

use bid_core::{ConfigError, PlatformError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    /// Fractional jitter; 0.25 perturbs each delay uniformly within ±25 %.
    pub jitter: f64,
    /// Upper bound for a single attempt; an attempt that runs longer is a timeout.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.25,
            attempt_timeout: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be in [0, 1)"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::invalid("retry.attempt_timeout", "must be non-zero"));
        }
        Ok(())
    }
}

/// What one attempt did, handed to the observer before any backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    /// 1-based attempt number.
    pub attempt: u32,
    pub latency: Duration,
    /// `None` on success.
    pub error: Option<PlatformError>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, PlatformError>,
    pub attempts: u32,
    /// Backoff delays actually slept, in order.
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn nominal_backoff(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        self.cfg.initial_backoff.mul_f64(self.cfg.multiplier.powi(exp))
    }

    /// Nominal delay perturbed by uniform jitter.
    pub fn backoff_with<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_backoff(retry);
        if self.cfg.jitter == 0.0 {
            return nominal;
        }
        let factor = rng.gen_range((1.0 - self.cfg.jitter)..=(1.0 + self.cfg.jitter));
        nominal.mul_f64(factor)
    }

    fn jittered_backoff(&self, retry: u32) -> Duration {
        self.backoff_with(retry, &mut rand::thread_rng())
    }

    /// Run `op` until it succeeds, fails permanently, or `max_retries` retries of
    /// transient failures are spent. `observe` sees every attempt as it completes.
    pub async fn run<T, F, Fut, O>(&self, mut op: F, mut observe: O) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
        O: FnMut(&AttemptReport),
    {
        let mut delays = Vec::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = match timeout(self.cfg.attempt_timeout, op(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(PlatformError::Timeout),
            };
            let report = AttemptReport {
                attempt,
                latency: started.elapsed(),
                error: result.as_ref().err().cloned(),
            };
            observe(&report);

            let err = match result {
                Ok(v) => return RetryOutcome { result: Ok(v), attempts: attempt, delays },
                Err(e) => e,
            };
            let retries_used = attempt - 1;
            if !err.is_transient() || retries_used >= self.cfg.max_retries {
                debug!(attempt, error = %err, "giving up");
                return RetryOutcome { result: Err(err), attempts: attempt, delays };
            }
            let delay = self.jittered_backoff(retries_used + 1);
            debug!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying");
            delays.push(delay);
            sleep(delay).await;
        }
    }
}
