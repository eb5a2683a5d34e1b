//! Agent configuration.
//!
//! Durations are stored in milliseconds (`*_ms`) so the struct can be read
//! straight from TOML; accessors hand out `Duration`s.
//!
//! ```rust,ignore
//! let config = AgentConfig::builder()
//!     .pod_id(PodId::new("agent-0"))
//!     .slots(4)
//!     .dispatch_timeout(Duration::from_secs(120))
//!     .build()?;
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::app::backoff::RetryPolicy;
use crate::domain::PodId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    ZeroValue { field: &'static str },

    #[error("invalid retry multiplier {0}: must be finite and >= 1.0")]
    InvalidMultiplier(f64),

    #[error("pod id must not be empty")]
    EmptyPodId,

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pod_id: PodId,
    pod_name: String,
    slots: usize,
    pull_batch_size: usize,
    pull_idle_backoff_ms: u64,
    dispatch_timeout_ms: u64,
    grace_delay_ms: u64,
    cancellation_poll_interval_ms: u64,
    /// Consecutive failures tolerated before the agent turns unhealthy.
    /// Negative disables the budget.
    max_error_allowed: i64,
    max_acquisition_rounds: u32,
    infra_retry_base_delay_ms: u64,
    infra_retry_multiplier: f64,
    infra_retry_max_attempts: u32,
    scratch_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let pod = format!("pollster-{}", ulid::Ulid::new());
        Self {
            pod_id: PodId::new(pod.clone()),
            pod_name: pod,
            slots: 1,
            pull_batch_size: 1,
            pull_idle_backoff_ms: 200,
            dispatch_timeout_ms: 300_000,
            grace_delay_ms: 15_000,
            cancellation_poll_interval_ms: 1_000,
            max_error_allowed: 5,
            max_acquisition_rounds: 3,
            infra_retry_base_delay_ms: 100,
            infra_retry_multiplier: 2.0,
            infra_retry_max_attempts: 5,
            scratch_root: std::env::temp_dir().join("pollster"),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pod_id.as_str().is_empty() {
            return Err(ConfigError::EmptyPodId);
        }
        if self.slots < 1 {
            return Err(ConfigError::ZeroValue { field: "slots" });
        }
        if self.pull_batch_size < 1 {
            return Err(ConfigError::ZeroValue {
                field: "pull_batch_size",
            });
        }
        if self.max_acquisition_rounds < 1 {
            return Err(ConfigError::ZeroValue {
                field: "max_acquisition_rounds",
            });
        }
        if self.infra_retry_max_attempts < 1 {
            return Err(ConfigError::ZeroValue {
                field: "infra_retry_max_attempts",
            });
        }
        if !(self.infra_retry_multiplier.is_finite() && self.infra_retry_multiplier >= 1.0) {
            return Err(ConfigError::InvalidMultiplier(self.infra_retry_multiplier));
        }
        Ok(())
    }

    pub fn pod_id(&self) -> &PodId {
        &self.pod_id
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    /// Tasks executed concurrently by this agent.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Messages requested per pull.
    pub fn pull_batch_size(&self) -> usize {
        self.pull_batch_size
    }

    /// Pause after an empty or failed pull.
    pub fn pull_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.pull_idle_backoff_ms)
    }

    /// How long another agent may hold a task in `Dispatched` before its
    /// liveness is questioned.
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Delay between a cancellation request and the hard abort.
    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn cancellation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancellation_poll_interval_ms)
    }

    pub fn max_error_allowed(&self) -> i64 {
        self.max_error_allowed
    }

    pub fn max_acquisition_rounds(&self) -> u32 {
        self.max_acquisition_rounds
    }

    pub fn infra_retry(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.infra_retry_base_delay_ms),
            multiplier: self.infra_retry_multiplier,
            max_attempts: self.infra_retry_max_attempts,
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }
}

#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    /// Sets the pod id; the pod name follows unless set explicitly afterwards.
    pub fn pod_id(mut self, pod_id: PodId) -> Self {
        self.config.pod_name = pod_id.as_str().to_owned();
        self.config.pod_id = pod_id;
        self
    }

    pub fn pod_name(mut self, name: impl Into<String>) -> Self {
        self.config.pod_name = name.into();
        self
    }

    pub fn slots(mut self, slots: usize) -> Self {
        self.config.slots = slots;
        self
    }

    pub fn pull_batch_size(mut self, size: usize) -> Self {
        self.config.pull_batch_size = size;
        self
    }

    pub fn pull_idle_backoff(mut self, d: Duration) -> Self {
        self.config.pull_idle_backoff_ms = d.as_millis() as u64;
        self
    }

    pub fn dispatch_timeout(mut self, d: Duration) -> Self {
        self.config.dispatch_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn grace_delay(mut self, d: Duration) -> Self {
        self.config.grace_delay_ms = d.as_millis() as u64;
        self
    }

    pub fn cancellation_poll_interval(mut self, d: Duration) -> Self {
        self.config.cancellation_poll_interval_ms = d.as_millis() as u64;
        self
    }

    pub fn max_error_allowed(mut self, n: i64) -> Self {
        self.config.max_error_allowed = n;
        self
    }

    pub fn max_acquisition_rounds(mut self, n: u32) -> Self {
        self.config.max_acquisition_rounds = n;
        self
    }

    pub fn infra_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.infra_retry_base_delay_ms = policy.base_delay.as_millis() as u64;
        self.config.infra_retry_multiplier = policy.multiplier;
        self.config.infra_retry_max_attempts = policy.max_attempts;
        self
    }

    pub fn scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = path.into();
        self
    }

    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slots(), 1);
        assert_eq!(config.max_acquisition_rounds(), 3);
        assert_eq!(config.pod_id().as_str(), config.pod_name());
    }

    #[test]
    fn builder_sets_durations() {
        let config = AgentConfig::builder()
            .pod_id(PodId::new("agent-0"))
            .slots(4)
            .dispatch_timeout(Duration::from_secs(120))
            .grace_delay(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.pod_id(), &PodId::new("agent-0"));
        assert_eq!(config.pod_name(), "agent-0");
        assert_eq!(config.slots(), 4);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(120));
        assert_eq!(config.grace_delay(), Duration::from_millis(250));
    }

    #[test]
    fn zero_slots_is_rejected() {
        let err = AgentConfig::builder().slots(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroValue { field: "slots" }));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = AgentConfig::from_toml_str("pull_batch_size = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ZeroValue {
                field: "pull_batch_size"
            }
        ));
    }

    #[test]
    fn infinite_multiplier_is_rejected() {
        let err = AgentConfig::from_toml_str("infra_retry_multiplier = inf").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMultiplier(m) if m.is_infinite()));
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
            pod_id = "10.1.2.3"
            pod_name = "agent-a"
            slots = 8
            dispatch_timeout_ms = 1000
            max_error_allowed = -1
            infra_retry_multiplier = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(config.pod_id().as_str(), "10.1.2.3");
        assert_eq!(config.pod_name(), "agent-a");
        assert_eq!(config.slots(), 8);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_error_allowed(), -1);
        assert_eq!(config.infra_retry().multiplier, 1.5);
        assert_eq!(config.pull_batch_size(), 1);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            AgentConfig::from_toml_str("slots = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
