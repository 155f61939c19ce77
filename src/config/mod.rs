//! # Conductor Configuration
//!
//! Static configuration snapshot consumed by every component. Values come from
//! compiled-in defaults, an optional TOML file and `CONDUCTOR__*` environment
//! overrides (see [`ConfigManager`]). Components receive the sections they need
//! at construction time; nothing reads configuration globally.
//!
//! ```rust,no_run
//! use conductor_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let heartbeat = manager.config().heartbeat.interval();
//! # let _ = heartbeat;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::defaults;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/conductor.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub history: HistoryConfig,
    pub events: EventsConfig,
    pub scheduler: SchedulerConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
}

impl ConductorConfig {
    /// Validate cross-field constraints; called by the loader after merging
    pub fn validate(&self) -> ConfigResult<()> {
        self.server.bind_address.parse::<std::net::SocketAddr>().map_err(|e| {
            ConfigurationError::InvalidValue {
                field: "server.bind_address".to_string(),
                value: self.server.bind_address.clone(),
                context: e.to_string(),
            }
        })?;

        if self.server.conductor_id.trim().is_empty() {
            return Err(ConfigurationError::MissingRequiredField {
                field: "conductor_id".to_string(),
                context: "server".to_string(),
            });
        }

        require_positive("server.max_connections", self.server.max_connections as u64)?;
        require_positive(
            "server.outbound_queue_size",
            self.server.outbound_queue_size as u64,
        )?;
        require_positive("heartbeat.interval_ms", self.heartbeat.interval_ms)?;

        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(ConfigurationError::InvalidValue {
                field: "heartbeat.timeout_ms".to_string(),
                value: self.heartbeat.timeout_ms.to_string(),
                context: "must be greater than heartbeat.interval_ms".to_string(),
            });
        }

        require_positive("history.max_messages", self.history.max_messages as u64)?;
        require_positive(
            "history.max_messages_per_logical_id",
            self.history.max_messages_per_logical_id as u64,
        )?;
        require_positive("events.max_channels", self.events.max_channels as u64)?;
        require_positive(
            "events.max_subscribers_per_channel",
            self.events.max_subscribers_per_channel as u64,
        )?;
        require_positive("events.max_recursion_depth", self.events.max_recursion_depth as u64)?;
        require_positive("events.handler_timeout_ms", self.events.handler_timeout_ms)?;
        require_positive(
            "scheduler.max_terminal_tasks",
            self.scheduler.max_terminal_tasks as u64,
        )?;

        self.circuit_breaker
            .to_resilience_config()
            .validate()
            .map_err(|reason| ConfigurationError::InvalidValue {
                field: "circuit_breaker".to_string(),
                value: format!("{:?}", self.circuit_breaker),
                context: reason,
            })?;

        self.retry
            .to_resilience_config()
            .validate()
            .map_err(|reason| ConfigurationError::InvalidValue {
                field: "retry".to_string(),
                value: format!("{:?}", self.retry),
                context: reason,
            })?;

        Ok(())
    }
}

fn require_positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigurationError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            context: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

/// Listening socket and connection limits
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Logical id the conductor uses as sender/recipient on the wire
    pub conductor_id: String,
    pub max_connections: usize,
    /// Bounded per-connection outbound queue; a full queue applies backpressure
    pub outbound_queue_size: usize,
    /// How long a send may wait on a full outbound queue
    pub send_timeout_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::BIND_ADDRESS.to_string(),
            conductor_id: defaults::CONDUCTOR_LOGICAL_ID.to_string(),
            max_connections: defaults::MAX_CONNECTIONS,
            outbound_queue_size: defaults::OUTBOUND_QUEUE_SIZE,
            send_timeout_ms: defaults::SEND_TIMEOUT_MS,
            graceful_shutdown_timeout_ms: defaults::GRACEFUL_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            timeout_ms: defaults::HEARTBEAT_TIMEOUT_MS,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Message persistence and replay bounds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_messages: usize,
    pub max_messages_per_logical_id: usize,
    /// Upper bound on messages replayed to a reconnecting endpoint
    pub retention_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: defaults::MAX_PERSISTED_MESSAGES,
            max_messages_per_logical_id: defaults::MAX_MESSAGES_PER_LOGICAL_ID,
            retention_limit: defaults::HISTORY_RETENTION_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub max_channels: usize,
    pub max_subscribers_per_channel: usize,
    pub handler_timeout_ms: u64,
    pub max_recursion_depth: usize,
    pub debounce_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_channels: defaults::MAX_EVENT_CHANNELS,
            max_subscribers_per_channel: defaults::MAX_SUBSCRIBERS_PER_CHANNEL,
            handler_timeout_ms: defaults::HANDLER_TIMEOUT_MS,
            max_recursion_depth: defaults::MAX_RECURSION_DEPTH,
            debounce_ms: defaults::DEBOUNCE_MS,
        }
    }
}

impl EventsConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retries granted to a task reported as retryably failed
    pub max_retries: u32,
    pub subtask_timeout_ms: u64,
    /// Finished tasks kept for lookup before the oldest are pruned
    pub max_terminal_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_TASK_RETRIES,
            subtask_timeout_ms: defaults::SUBTASK_TIMEOUT_MS,
            max_terminal_tasks: defaults::MAX_TERMINAL_TASKS,
        }
    }
}

impl SchedulerConfig {
    pub fn subtask_timeout(&self) -> Duration {
        Duration::from_millis(self.subtask_timeout_ms)
    }
}

/// Flat, file-friendly circuit breaker thresholds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            recovery_timeout_ms: defaults.recovery_timeout.as_millis() as u64,
            monitoring_period_ms: defaults.monitoring_period.as_millis() as u64,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            monitoring_period: Duration::from_millis(self.monitoring_period_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            jitter_max_ms: defaults.jitter_max.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn to_resilience_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_max: Duration::from_millis(self.jitter_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConductorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.conductor_id, "conductor");
        assert_eq!(config.history.max_messages, 1000);
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut config = ConductorConfig::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("heartbeat.timeout_ms"));
    }

    #[test]
    fn test_terminal_task_retention_must_be_positive() {
        let mut config = ConductorConfig::default();
        assert_eq!(config.scheduler.max_terminal_tasks, 10_000);
        config.scheduler.max_terminal_tasks = 0;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("scheduler.max_terminal_tasks"));
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        let mut config = ConductorConfig::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resilience_conversion_round_trips_thresholds() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 7,
            recovery_timeout_ms: 1500,
            ..Default::default()
        };
        let breaker = settings.to_resilience_config();
        assert_eq!(breaker.failure_threshold, 7);
        assert_eq!(breaker.recovery_timeout, Duration::from_millis(1500));
    }
}
