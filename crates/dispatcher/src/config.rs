//! YAML engine configuration with `BIDGUARD_*` environment overrides.

use crate::connector::ConnectorSpec;
use bid_core::{ConfigError, Platform};
use budget::BudgetConfig;
use fallback::{FallbackConfig, DEFAULT_HISTORY_CAPACITY};
use resilience::{BreakerConfig, RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG: &str = "BIDGUARD_CONFIG";
pub const ENV_MAX_BUDGET: &str = "BIDGUARD_MAX_BUDGET";
pub const ENV_AUDIT_PATH: &str = "BIDGUARD_AUDIT_PATH";

const DEFAULT_BUDGET_WINDOW_SECS: u64 = 24 * 60 * 60;
const DEFAULT_AUDIT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSection {
    pub max_calls: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformSection {
    pub platform: Platform,
    /// May be omitted when `BIDGUARD_MAX_BUDGET` supplies it.
    #[serde(default)]
    pub max_budget: Option<f64>,
    #[serde(default = "default_budget_window_secs")]
    pub budget_window_secs: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSection>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

fn default_budget_window_secs() -> u64 {
    DEFAULT_BUDGET_WINDOW_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_successes_required: u32,
    pub slow_call_threshold_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let d = BreakerConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            reset_timeout_ms: millis(d.reset_timeout),
            half_open_successes_required: d.half_open_successes_required,
            slow_call_threshold_ms: millis(d.slow_call_threshold),
        }
    }
}

impl BreakerSection {
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            half_open_successes_required: self.half_open_successes_required,
            slow_call_threshold: Duration::from_millis(self.slow_call_threshold_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    /// Defaults to the breaker's slow-call threshold.
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetrySection {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_retries: d.max_retries,
            initial_backoff_ms: millis(d.initial_backoff),
            multiplier: d.multiplier,
            jitter: d.jitter,
            attempt_timeout_ms: None,
        }
    }
}

impl RetrySection {
    pub fn to_config(&self, breaker: &BreakerSection) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
            attempt_timeout: Duration::from_millis(
                self.attempt_timeout_ms.unwrap_or(breaker.slow_call_threshold_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackSection {
    pub base_fraction: f64,
    pub baseline_bid: f64,
    pub history_capacity: usize,
}

impl Default for FallbackSection {
    fn default() -> Self {
        let d = FallbackConfig::default();
        Self {
            base_fraction: d.base_fraction,
            baseline_bid: d.baseline_bid,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditSection {
    pub path: PathBuf,
    #[serde(default = "default_audit_capacity")]
    pub channel_capacity: usize,
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub platforms: Vec<PlatformSection>,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub audit: Option<AuditSection>,
    #[serde(default)]
    pub connector: ConnectorSpec,
}

/// Fully resolved settings for one platform dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformSettings {
    pub platform: Platform,
    pub budget: BudgetConfig,
    pub rate_limit: RateLimitConfig,
    pub multiplier: f64,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub fallback: FallbackConfig,
    pub history_capacity: usize,
}

impl PlatformSettings {
    /// Reference defaults for `platform` with the given budget.
    pub fn new(platform: Platform, max_budget: f64, budget_window: Duration) -> Self {
        let breaker = BreakerConfig::default();
        Self {
            platform,
            budget: BudgetConfig { max_budget, window: budget_window },
            rate_limit: RateLimitConfig::for_platform(platform),
            multiplier: platform.default_multiplier(),
            breaker,
            retry: RetryConfig { attempt_timeout: breaker.slow_call_threshold, ..RetryConfig::default() },
            fallback: FallbackConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.budget.validate()?;
        if self.rate_limit.max_calls == 0 {
            return Err(ConfigError::invalid("rate_limit.max_calls", "must be > 0"));
        }
        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::ZeroWindow("rate limit"));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(ConfigError::invalid("multiplier", "must be finite and > 0"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be > 0"));
        }
        if self.breaker.half_open_successes_required == 0 {
            return Err(ConfigError::invalid("breaker.half_open_successes_required", "must be > 0"));
        }
        if self.breaker.reset_timeout.is_zero() {
            return Err(ConfigError::ZeroWindow("breaker reset"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid("fallback.history_capacity", "must be > 0"));
        }
        self.retry.validate()
    }
}

impl EngineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, LoadError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let mut cfg = Self::from_path(path)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from the file named by `BIDGUARD_CONFIG`, if set.
    pub fn from_env() -> Result<Option<Self>, LoadError> {
        match std::env::var(ENV_CONFIG) {
            Ok(path) if !path.trim().is_empty() => Self::load(path).map(Some),
            _ => Ok(None),
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|k| std::env::var(k).ok())
    }

    /// Apply overrides from any key lookup. `BIDGUARD_MAX_BUDGET` only fills platforms
    /// without an explicit budget.
    pub fn apply_overrides_from<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = get(ENV_MAX_BUDGET) {
            let v: f64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("BIDGUARD_MAX_BUDGET", format!("not a number: {raw}")))?;
            for p in self.platforms.iter_mut().filter(|p| p.max_budget.is_none()) {
                p.max_budget = Some(v);
            }
        }
        if let Some(path) = get(ENV_AUDIT_PATH).filter(|s| !s.trim().is_empty()) {
            let capacity = self.audit.as_ref().map_or(DEFAULT_AUDIT_CAPACITY, |a| a.channel_capacity);
            self.audit = Some(AuditSection { path: PathBuf::from(path), channel_capacity: capacity });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.platform_settings().map(|_| ())
    }

    /// Resolve every platform section into validated settings.
    pub fn platform_settings(&self) -> Result<Vec<PlatformSettings>, ConfigError> {
        if self.platforms.is_empty() {
            return Err(ConfigError::invalid("platforms", "at least one platform is required"));
        }
        self.connector.validate()?;
        if let Some(a) = &self.audit {
            if a.channel_capacity == 0 {
                return Err(ConfigError::invalid("audit.channel_capacity", "must be > 0"));
            }
        }
        let breaker = self.breaker.to_config();
        let retry = self.retry.to_config(&self.breaker);
        let fallback =
            FallbackConfig { base_fraction: self.fallback.base_fraction, baseline_bid: self.fallback.baseline_bid };
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(self.platforms.len());
        for section in &self.platforms {
            if !seen.insert(section.platform) {
                return Err(ConfigError::DuplicatePlatform(section.platform.to_string()));
            }
            let max_budget = section
                .max_budget
                .ok_or_else(|| ConfigError::MissingBudget(section.platform.to_string()))?;
            let mut s = PlatformSettings::new(
                section.platform,
                max_budget,
                Duration::from_secs(section.budget_window_secs),
            );
            if let Some(rl) = &section.rate_limit {
                s.rate_limit =
                    RateLimitConfig { max_calls: rl.max_calls, window: Duration::from_secs(rl.window_secs) };
            }
            if let Some(m) = section.multiplier {
                s.multiplier = m;
            }
            s.breaker = breaker;
            s.retry = retry;
            s.fallback = fallback;
            s.history_capacity = self.fallback.history_capacity;
            s.validate()?;
            out.push(s);
        }
        Ok(out)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r"
platforms:
  - platform: google_ads
    max_budget: 500.0
    budget_window_secs: 600
    rate_limit: { max_calls: 100, window_secs: 60 }
  - platform: tiktok
breaker: { failure_threshold: 3, reset_timeout_ms: 30000 }
retry: { max_retries: 3, initial_backoff_ms: 100 }
fallback: { base_fraction: 0.30, baseline_bid: 5.0 }
audit: { path: audit.jsonl }
connector: { kind: simulated, seed: 9 }
";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn parses_sample_and_fills_defaults() {
        let cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.platforms.len(), 2);
        assert_eq!(cfg.platforms[1].budget_window_secs, DEFAULT_BUDGET_WINDOW_SECS);
        assert_eq!(cfg.breaker.slow_call_threshold_ms, 500);
        assert_eq!(cfg.audit.as_ref().unwrap().channel_capacity, DEFAULT_AUDIT_CAPACITY);
        // tiktok has no budget yet
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingBudget(p)) if p == "tiktok"));
    }

    #[test]
    fn env_budget_fills_only_missing_platforms() {
        let mut cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.apply_overrides_from(env(&[(ENV_MAX_BUDGET, "250"), (ENV_AUDIT_PATH, "/tmp/a.jsonl")]))
            .unwrap();
        let settings = cfg.platform_settings().unwrap();
        assert_eq!(settings[0].budget.max_budget, 500.0);
        assert_eq!(settings[1].budget.max_budget, 250.0);
        assert_eq!(settings[1].multiplier, 1.5);
        assert_eq!(settings[1].rate_limit, RateLimitConfig::for_platform(Platform::TikTok));
        assert_eq!(settings[0].retry.attempt_timeout, Duration::from_millis(500));
        assert_eq!(cfg.audit.unwrap().path, PathBuf::from("/tmp/a.jsonl"));
    }

    #[test]
    fn bad_env_budget_is_a_config_error() {
        let mut cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert!(cfg.apply_overrides_from(env(&[(ENV_MAX_BUDGET, "lots")])).is_err());
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let dup = "platforms:\n  - { platform: meta, max_budget: 1 }\n  - { platform: meta, max_budget: 2 }\n";
        let cfg = EngineConfig::from_yaml_str(dup).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicatePlatform(_))));

        let neg = "platforms:\n  - { platform: meta, max_budget: -1 }\n";
        let cfg = EngineConfig::from_yaml_str(neg).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::NonPositiveBudget(_))));

        let zero_rl =
            "platforms:\n  - { platform: x, max_budget: 1, rate_limit: { max_calls: 0, window_secs: 1 } }\n";
        assert!(EngineConfig::from_yaml_str(zero_rl).unwrap().validate().is_err());

        assert!(EngineConfig::default().validate().is_err());
    }

    #[test]
    fn simulator_rates_are_range_checked() {
        let base = "platforms:\n  - { platform: meta, max_budget: 10 }\n";
        for connector in [
            "connector: { kind: simulated, transient_failure_rate: 1.5 }",
            "connector: { kind: simulated, decline_rate: -0.1 }",
            "connector: { kind: simulated, transient_failure_rate: .nan }",
            "connector: { kind: simulated, transient_failure_rate: 0.6, permanent_failure_rate: 0.5 }",
        ] {
            let cfg = EngineConfig::from_yaml_str(&format!("{base}{connector}\n")).unwrap();
            assert!(
                matches!(cfg.validate(), Err(ConfigError::InvalidParameter { .. })),
                "{connector}"
            );
        }
        let ok = "connector: { kind: simulated, transient_failure_rate: 0.5, decline_rate: 0.5 }";
        assert!(EngineConfig::from_yaml_str(&format!("{base}{ok}\n")).unwrap().validate().is_ok());
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let bad = "platforms: []\nbogus: 1\n";
        assert!(matches!(EngineConfig::from_yaml_str(bad), Err(LoadError::Yaml(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "platforms:\n  - { platform: amazon, max_budget: 40 }\n").unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.platforms[0].platform, Platform::Amazon);
        assert!(matches!(EngineConfig::load(dir.path().join("missing.yaml")), Err(LoadError::Io(_))));
    }
}
