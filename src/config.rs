//! Configuration for the dispatch pipeline
//!
//! Settings are read from a TOML file and then overridden from environment
//! variables named `SWITCHYARD_<SECTION>__<FIELD>` (note the double
//! underscore), e.g. `SWITCHYARD_RETRY__MAX_ATTEMPTS=5`. A `.env` file in the
//! working directory is loaded first. Values are parsed as JSON literals where
//! possible, otherwise taken as strings.
//!
//! ```toml
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 50
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! timeout_secs = 10
//!
//! [jitter]
//! max_jitter_percent = 0.2
//! ```

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use switchyard_cache::JitterConfig;
use switchyard_cqrs::IdempotencyConfig;
use switchyard_events::EventBusConfig;
use switchyard_resilience::{BulkheadConfig, CircuitBreakerConfig, RetryConfig, TimeoutConfig};
use thiserror::Error;
use tracing::debug;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SWITCHYARD_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Circuit breaker defaults for per-resource breakers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    /// Cooldown before a trial call, in seconds
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 30,
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_config(&self, name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(name)
            .failure_threshold(self.failure_threshold)
            .timeout(Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySection {
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .multiplier(self.multiplier)
            .jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSection {
    pub max_concurrent: u32,
    pub max_queue: u32,
    /// Longest a queued call waits for a slot; unbounded when absent
    pub max_wait_ms: Option<u64>,
}

impl Default for BulkheadSection {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 10,
            max_wait_ms: None,
        }
    }
}

impl BulkheadSection {
    pub fn to_config(&self, name: impl Into<String>) -> BulkheadConfig {
        let config = BulkheadConfig::new(name, self.max_concurrent).max_queue(self.max_queue);
        match self.max_wait_ms {
            Some(ms) => config.max_wait(Duration::from_millis(ms)),
            None => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub duration_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self { duration_ms: 30_000 }
    }
}

impl TimeoutSection {
    pub fn to_config(&self, name: impl Into<String>) -> TimeoutConfig {
        TimeoutConfig::new(Duration::from_millis(self.duration_ms)).name(name)
    }
}

/// Query cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterSection {
    pub min_jitter_percent: f64,
    pub max_jitter_percent: f64,
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub early_recompute_window_secs: u64,
    pub early_recompute_probability: f64,
}

impl Default for JitterSection {
    fn default() -> Self {
        let defaults = JitterConfig::default();
        Self {
            min_jitter_percent: defaults.min_jitter_percent,
            max_jitter_percent: defaults.max_jitter_percent,
            lock_timeout_ms: defaults.lock_timeout.as_millis() as u64,
            lock_poll_interval_ms: defaults.lock_poll_interval.as_millis() as u64,
            early_recompute_window_secs: defaults.early_recompute_window.as_secs(),
            early_recompute_probability: defaults.early_recompute_probability,
        }
    }
}

impl JitterSection {
    pub fn to_config(&self) -> JitterConfig {
        JitterConfig::default()
            .jitter_range(self.min_jitter_percent, self.max_jitter_percent)
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .lock_poll_interval(Duration::from_millis(self.lock_poll_interval_ms))
            .early_recompute(
                Duration::from_secs(self.early_recompute_window_secs),
                self.early_recompute_probability,
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySection {
    pub ttl_secs: u64,
    pub key_prefix: String,
    pub lock_ttl_secs: u64,
    pub in_flight_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        let defaults = IdempotencyConfig::default();
        Self {
            ttl_secs: defaults.ttl.as_secs(),
            key_prefix: defaults.key_prefix,
            lock_ttl_secs: defaults.lock_ttl.as_secs(),
            in_flight_wait_ms: defaults.in_flight_wait.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
        }
    }
}

impl IdempotencySection {
    pub fn to_config(&self) -> IdempotencyConfig {
        IdempotencyConfig::default()
            .ttl(Duration::from_secs(self.ttl_secs))
            .key_prefix(self.key_prefix.clone())
            .lock_ttl(Duration::from_secs(self.lock_ttl_secs))
            .in_flight_wait(Duration::from_millis(self.in_flight_wait_ms))
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusSection {
    /// Run handlers of one event concurrently
    pub concurrent: bool,
    pub enable_logging: bool,
}

impl Default for EventBusSection {
    fn default() -> Self {
        let defaults = EventBusConfig::default();
        Self {
            concurrent: defaults.concurrent,
            enable_logging: defaults.enable_logging,
        }
    }
}

impl EventBusSection {
    pub fn to_config(&self) -> EventBusConfig {
        EventBusConfig {
            concurrent: self.concurrent,
            enable_logging: self.enable_logging,
        }
    }
}

/// Complete Switchyard configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwitchyardConfig {
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetrySection,
    pub bulkhead: BulkheadSection,
    pub timeout: TimeoutSection,
    pub jitter: JitterSection,
    pub idempotency: IdempotencySection,
    pub event_bus: EventBusSection,
    pub log: LogConfig,
}

impl SwitchyardConfig {
    /// Parse TOML. Missing sections and fields keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Load(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `.env`, the optional TOML file and `SWITCHYARD_*` overrides, then
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(ConfigError::Load(format!(".env: {}", e)));
            }
        }

        let config = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        let config = config.with_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SWITCHYARD_<SECTION>__<FIELD>` overrides from `vars`. Other
    /// variables are ignored.
    pub fn with_overrides<I>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tree = serde_json::to_value(&self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut applied = 0;

        for (name, raw) in vars {
            let Some(path) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let Some((section, field)) = path.split_once("__") else {
                continue;
            };
            let slot = tree
                .get_mut(section.to_lowercase())
                .and_then(|s| s.get_mut(field.to_lowercase()))
                .ok_or_else(|| ConfigError::UnknownKey(name.clone()))?;
            *slot = parse_env_value(&raw);
            applied += 1;
        }

        if applied == 0 {
            return Ok(self);
        }
        serde_json::from_value(tree).map_err(|e| ConfigError::Parse(format!("environment override: {}", e)))
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));

        if self.circuit_breaker.failure_threshold == 0 {
            return fail("circuit_breaker.failure_threshold must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return fail(format!("retry.multiplier must be >= 1.0, got {}", self.retry.multiplier));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return fail("retry.base_delay_ms must not exceed retry.max_delay_ms".into());
        }
        if self.bulkhead.max_concurrent == 0 {
            return fail("bulkhead.max_concurrent must be at least 1".into());
        }
        if self.timeout.duration_ms == 0 {
            return fail("timeout.duration_ms must be positive".into());
        }
        if self.idempotency.ttl_secs == 0 {
            return fail("idempotency.ttl_secs must be positive".into());
        }
        if self.idempotency.poll_interval_ms == 0 {
            return fail("idempotency.poll_interval_ms must be positive".into());
        }
        self.jitter
            .to_config()
            .validate()
            .map_err(|e| ConfigError::Validation(format!("jitter: {}", e)))?;
        self.log
            .env_filter()
            .map_err(|e| ConfigError::Validation(format!("log: {}", e)))?;
        Ok(())
    }
}

/// JSON literal if `raw` parses as one, otherwise a string.
fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => value,
        _ => Value::String(raw.to_string()),
    }
}
