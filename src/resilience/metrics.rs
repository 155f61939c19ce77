//! # Circuit Breaker Metrics

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls rejected without invoking the wrapped operation
    pub rejected_count: u64,
    pub consecutive_failures: u64,
    /// Consecutive successes observed while half-open
    pub half_open_successes: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            consecutive_failures: 0,
            half_open_successes: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Mean duration of the recorded calls, zero before the first call
    pub fn mean_call_duration(&self) -> Duration {
        if self.total_calls == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(self.total_calls);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated view across every breaker owned by a manager
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub total_circuit_breakers: usize,
    pub open_circuit_breakers: usize,
    pub half_open_circuit_breakers: usize,
    pub total_calls: u64,
    pub total_failures: u64,
}

impl SystemCircuitBreakerMetrics {
    /// Fraction of breakers not currently open
    pub fn health_score(&self) -> f64 {
        if self.total_circuit_breakers == 0 {
            return 1.0;
        }
        let healthy = self.total_circuit_breakers - self.open_circuit_breakers;
        healthy as f64 / self.total_circuit_breakers as f64
    }
}
