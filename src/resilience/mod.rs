//! # Resilience Module
//!
//! Failure isolation for message delivery and event dispatch.
//!
//! - **Circuit Breakers**: fail fast after repeated failures, probe recovery
//! - **Retry Manager**: exponential backoff with bounded jitter
//! - **Manager**: named breakers with aggregated metrics
//!
//! ```rust,no_run
//! use conductor_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("message_delivery", CircuitBreakerConfig::default());
//! let value = breaker.call(|| async { Ok::<_, String>("delivered") }).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::{CircuitBreakerConfig, RetryConfig};
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use retry::{RetryError, RetryManager, RetryableError};
