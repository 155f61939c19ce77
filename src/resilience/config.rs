//! # Resilience Configuration
//!
//! Runtime (Duration-based) thresholds for circuit breakers and retries. The
//! flat, file-friendly equivalents live in [`crate::config`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (inside `monitoring_period`) that open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close the circuit
    pub success_threshold: u32,

    /// Time spent open before a trial call is let through
    pub recovery_timeout: Duration,

    /// Failures older than this no longer count towards the threshold
    pub monitoring_period: Duration,
}

impl CircuitBreakerConfig {
    /// Preset for message delivery to endpoints
    pub fn for_message_delivery() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(10),
            monitoring_period: Duration::from_secs(60),
        }
    }

    /// Preset for in-process event handlers
    pub fn for_event_handlers() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(5),
            monitoring_period: Duration::from_secs(30),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }

        if self.recovery_timeout > Duration::from_secs(300) {
            return Err("recovery_timeout should not exceed 300 seconds".to_string());
        }

        if self.monitoring_period.is_zero() {
            return Err("monitoring_period must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff policy for [`crate::resilience::RetryManager`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay
    pub jitter_max: Duration,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }

        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }

        if self.max_delay < self.initial_delay {
            return Err("max_delay must not be smaller than initial_delay".to_string());
        }

        Ok(())
    }

    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter_max: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());

        let mut invalid = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        invalid = CircuitBreakerConfig {
            recovery_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        invalid = CircuitBreakerConfig {
            success_threshold: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_preset_configurations() {
        assert!(CircuitBreakerConfig::for_message_delivery().validate().is_ok());
        assert!(CircuitBreakerConfig::for_event_handlers().validate().is_ok());
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::no_retry().validate().is_ok());

        let invalid = RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }
}
