//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is built either with [`RuntimeConfig::builder`] or
//! parsed from JSON with [`RuntimeConfig::from_json`]. Durations are
//! expressed in milliseconds in JSON; missing fields take their defaults.
//!
//! ```rust
//! use std::time::Duration;
//! use tether::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .namespace("orders")
//!     .tick_rate(Duration::from_millis(100))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.namespace(), "orders");
//!
//! let parsed = RuntimeConfig::from_json(r#"{ "message_timeout": 500 }"#).unwrap();
//! assert_eq!(parsed.message_timeout(), Duration::from_millis(500));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::DeactivationStrategy;

/// Errors produced while loading or validating a [`RuntimeConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A setting that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// The tick cannot observe lease renewal points.
    #[error("tick_rate {tick_rate:?} must be shorter than half of {lease} ({duration:?})")]
    TickTooSlow {
        lease: &'static str,
        tick_rate: Duration,
        duration: Duration,
    },

    /// The JSON document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(String),
}

/// Every tunable of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    namespace: String,
    #[serde(with = "millis")]
    tick_rate: Duration,
    #[serde(with = "millis")]
    message_timeout: Duration,
    #[serde(with = "millis")]
    addressable_ttl: Duration,
    #[serde(with = "millis")]
    deactivation_timeout: Duration,
    deactivation_strategy: DeactivationStrategy,
    pipeline_worker_count: usize,
    pipeline_buffer_count: usize,
    handle_queue_capacity: usize,
    max_routing_attempts: u32,
    #[serde(with = "millis")]
    node_lease_duration: Duration,
    #[serde(with = "millis")]
    addressable_lease_duration: Duration,
    placement_attempts: u32,
    #[serde(with = "millis")]
    placement_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            tick_rate: Duration::from_millis(1_000),
            message_timeout: Duration::from_millis(3_000),
            addressable_ttl: Duration::from_secs(10 * 60),
            deactivation_timeout: Duration::from_secs(10),
            deactivation_strategy: DeactivationStrategy::Instant,
            pipeline_worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pipeline_buffer_count: 10_000,
            handle_queue_capacity: 128,
            max_routing_attempts: 10,
            node_lease_duration: Duration::from_secs(10),
            addressable_lease_duration: Duration::from_secs(60),
            placement_attempts: 5,
            placement_backoff: Duration::from_millis(50),
        }
    }
}

impl RuntimeConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Parse and validate a JSON document.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_durations = [
            ("tick_rate", self.tick_rate),
            ("message_timeout", self.message_timeout),
            ("addressable_ttl", self.addressable_ttl),
            ("deactivation_timeout", self.deactivation_timeout),
            ("node_lease_duration", self.node_lease_duration),
            ("addressable_lease_duration", self.addressable_lease_duration),
        ];
        for (name, value) in positive_durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        let positive_counts = [
            ("pipeline_worker_count", self.pipeline_worker_count),
            ("pipeline_buffer_count", self.pipeline_buffer_count),
            ("handle_queue_capacity", self.handle_queue_capacity),
            ("max_routing_attempts", self.max_routing_attempts as usize),
            ("placement_attempts", self.placement_attempts as usize),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        self.deactivation_strategy.validate()?;

        // Leases are renewed at half their duration, and renewal only happens on a tick.
        for (lease, duration) in [
            ("node_lease_duration", self.node_lease_duration),
            ("addressable_lease_duration", self.addressable_lease_duration),
        ] {
            if self.tick_rate >= duration / 2 {
                return Err(ConfigError::TickTooSlow {
                    lease,
                    tick_rate: self.tick_rate,
                    duration,
                });
            }
        }

        Ok(())
    }

    /// Cluster namespace the node joins.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Interval of the execution tick, response sweep and lease renewal loops.
    pub fn tick_rate(&self) -> Duration {
        self.tick_rate
    }

    /// How long a caller waits for a response.
    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    /// Idle time after which an addressable is deactivated.
    pub fn addressable_ttl(&self) -> Duration {
        self.addressable_ttl
    }

    /// Upper bound on one addressable's deactivation during shutdown.
    pub fn deactivation_timeout(&self) -> Duration {
        self.deactivation_timeout
    }

    pub fn deactivation_strategy(&self) -> DeactivationStrategy {
        self.deactivation_strategy
    }

    pub fn pipeline_worker_count(&self) -> usize {
        self.pipeline_worker_count
    }

    pub fn pipeline_buffer_count(&self) -> usize {
        self.pipeline_buffer_count
    }

    pub fn handle_queue_capacity(&self) -> usize {
        self.handle_queue_capacity
    }

    pub fn max_routing_attempts(&self) -> u32 {
        self.max_routing_attempts
    }

    pub fn node_lease_duration(&self) -> Duration {
        self.node_lease_duration
    }

    pub fn addressable_lease_duration(&self) -> Duration {
        self.addressable_lease_duration
    }

    /// Placement tries before giving up with `NoAvailableNode`.
    pub fn placement_attempts(&self) -> u32 {
        self.placement_attempts
    }

    /// First backoff between placement tries; doubles each time.
    pub fn placement_backoff(&self) -> Duration {
        self.placement_backoff
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn tick_rate(mut self, tick_rate: Duration) -> Self {
        self.config.tick_rate = tick_rate;
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = timeout;
        self
    }

    pub fn addressable_ttl(mut self, ttl: Duration) -> Self {
        self.config.addressable_ttl = ttl;
        self
    }

    pub fn deactivation_timeout(mut self, timeout: Duration) -> Self {
        self.config.deactivation_timeout = timeout;
        self
    }

    pub fn deactivation_strategy(mut self, strategy: DeactivationStrategy) -> Self {
        self.config.deactivation_strategy = strategy;
        self
    }

    pub fn pipeline_worker_count(mut self, count: usize) -> Self {
        self.config.pipeline_worker_count = count;
        self
    }

    pub fn pipeline_buffer_count(mut self, count: usize) -> Self {
        self.config.pipeline_buffer_count = count;
        self
    }

    pub fn handle_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.handle_queue_capacity = capacity;
        self
    }

    pub fn max_routing_attempts(mut self, attempts: u32) -> Self {
        self.config.max_routing_attempts = attempts;
        self
    }

    pub fn node_lease_duration(mut self, duration: Duration) -> Self {
        self.config.node_lease_duration = duration;
        self
    }

    pub fn addressable_lease_duration(mut self, duration: Duration) -> Self {
        self.config.addressable_lease_duration = duration;
        self
    }

    pub fn placement_attempts(mut self, attempts: u32) -> Self {
        self.config.placement_attempts = attempts;
        self
    }

    pub fn placement_backoff(mut self, backoff: Duration) -> Self {
        self.config.placement_backoff = backoff;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
