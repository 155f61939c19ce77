//! Error types for the conductor core.
//!
//! Each subsystem keeps its own error enum close to the code that raises it;
//! everything converges on [`ConductorError`], which mirrors the failure
//! taxonomy reported back to endpoints in `SYSTEM_ERROR` messages.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConductorError {
    /// Malformed message or task submission
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
    /// Rejected dependency edge insertion
    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),
    /// State machine rejected a status change
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),
    /// Channel, subscriber, connection or message limit reached
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
    /// Request rejected while a breaker was open
    #[error("Circuit open: {0}")]
    CircuitOpen(String),
    /// Handler or operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Send to a logical id with no live connection
    #[error("Connection unbound: {0}")]
    ConnectionUnbound(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Stable code carried in `SYSTEM_ERROR` payloads
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::DependencyCycle(_) => "DEPENDENCY_CYCLE_ERROR",
            Self::IllegalTransition(_) => "ILLEGAL_TRANSITION_ERROR",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED_ERROR",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN_ERROR",
            Self::Timeout(_) => "TIMEOUT_ERROR",
            Self::ConnectionUnbound(_) => "CONNECTION_UNBOUND_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Offending field, when the error is tied to one
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Whether the caller may reasonably try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen(_) | Self::Timeout(_) | Self::ConnectionUnbound(_)
        )
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(error: serde_json::Error) -> Self {
        ConductorError::validation(format!("JSON serialization error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
