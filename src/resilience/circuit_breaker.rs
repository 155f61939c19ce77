//! # Circuit Breaker Implementation
//!
//! Classic three-state breaker: Closed (normal operation), Open (failing fast)
//! and Half-Open (trial calls after the recovery timeout). Failures only count
//! towards the threshold while they stay inside the monitoring period.

use crate::error::ConductorError;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - calls are let through and watched closely
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl<E: Into<ConductorError>> From<CircuitBreakerError<E>> for ConductorError {
    fn from(error: CircuitBreakerError<E>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { component } => ConductorError::CircuitOpen(component),
            CircuitBreakerError::OperationFailed(inner) => inner.into(),
        }
    }
}

/// Core circuit breaker implementation with atomic state management
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Current circuit state (atomic so `state()` never blocks)
    state: AtomicU8,

    config: CircuitBreakerConfig,

    metrics: Mutex<CircuitBreakerMetrics>,

    /// Timestamps of the current run of consecutive failures
    failure_window: Mutex<VecDeque<Instant>>,

    /// Time when circuit was opened (for recovery timeout calculations)
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            metrics: Mutex::new(CircuitBreakerMetrics::new()),
            failure_window: Mutex::new(VecDeque::new()),
            opened_at: Mutex::new(None),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// While open the operation is never invoked.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.should_allow_call().await {
            self.metrics.lock().await.rejected_count += 1;
            debug!(component = %self.name, "⛔ Call rejected, circuit open");
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => self.record_success(duration).await,
            Err(_) => self.record_failure(duration).await,
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Check if a call should be allowed based on current state
    async fn should_allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock().await;
                match opened_at {
                    Some(opened) if opened.elapsed() >= self.config.recovery_timeout => {
                        self.transition_to_half_open().await;
                        true
                    }
                    Some(_) => false,
                    None => {
                        warn!(component = %self.name, "Circuit open but no timestamp recorded");
                        self.transition_to_half_open().await;
                        true
                    }
                }
            }
        }
    }

    /// Record a successful operation
    pub async fn record_success(&self, duration: Duration) {
        let close = {
            let mut metrics = self.metrics.lock().await;
            metrics.total_calls += 1;
            metrics.success_count += 1;
            metrics.total_duration += duration;
            metrics.consecutive_failures = 0;

            match self.state() {
                CircuitState::HalfOpen => {
                    metrics.half_open_successes += 1;
                    metrics.half_open_successes >= self.config.success_threshold as u64
                }
                CircuitState::Closed => false,
                CircuitState::Open => {
                    warn!(component = %self.name, "Success recorded while circuit is open");
                    false
                }
            }
        };

        self.failure_window.lock().await.clear();

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        if close {
            self.transition_to_closed().await;
        }
    }

    /// Record a failed operation
    pub async fn record_failure(&self, duration: Duration) {
        let consecutive = {
            let mut window = self.failure_window.lock().await;
            let now = Instant::now();
            window.push_back(now);
            while let Some(oldest) = window.front() {
                if now.duration_since(*oldest) > self.config.monitoring_period {
                    window.pop_front();
                } else {
                    break;
                }
            }
            window.len() as u64
        };

        {
            let mut metrics = self.metrics.lock().await;
            metrics.total_calls += 1;
            metrics.failure_count += 1;
            metrics.total_duration += duration;
            metrics.consecutive_failures = consecutive;
        }

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            consecutive_failures = consecutive,
            "🔴 Operation failed"
        );

        match self.state() {
            CircuitState::Closed => {
                if consecutive >= self.config.failure_threshold as u64 {
                    self.transition_to_open().await;
                }
            }
            // Any failure while half-open reopens immediately
            CircuitState::HalfOpen => self.transition_to_open().await,
            CircuitState::Open => {}
        }
    }

    async fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        *self.opened_at.lock().await = None;
        self.failure_window.lock().await.clear();

        let mut metrics = self.metrics.lock().await;
        metrics.consecutive_failures = 0;
        metrics.half_open_successes = 0;

        info!(
            component = %self.name,
            total_calls = metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.lock().await = Some(Instant::now());

        let mut metrics = self.metrics.lock().await;
        metrics.half_open_successes = 0;

        warn!(
            component = %self.name,
            consecutive_failures = metrics.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    async fn transition_to_half_open(&self) {
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.metrics.lock().await.half_open_successes = 0;

        info!(
            component = %self.name,
            success_threshold = self.config.success_threshold,
            "🟡 Circuit breaker half-open (testing recovery)"
        );
    }

    /// Force circuit to open state (for emergency situations)
    pub async fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        self.transition_to_open().await;
    }

    /// Force circuit to closed state (for emergency recovery)
    pub async fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        self.transition_to_closed().await;
    }

    /// Get current metrics snapshot
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let metrics = self.metrics.lock().await;
        let mut snapshot = metrics.clone();
        snapshot.current_state = self.state();

        if metrics.total_calls > 0 {
            snapshot.failure_rate = metrics.failure_count as f64 / metrics.total_calls as f64;
            snapshot.success_rate = metrics.success_count as f64 / metrics.total_calls as f64;
            snapshot.average_duration = metrics.mean_call_duration();
        }

        snapshot
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
