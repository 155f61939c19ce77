use serde::{Deserialize, Serialize};

/// Events that can trigger task status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Submission accepted
    Validate,
    /// Hard dependencies satisfied
    MarkReady,
    /// Dispatch to a worker
    Start,
    Complete,
    Fail(String),
    Cancel,
    /// Failed task goes back to the ready heap
    Retry,
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::MarkReady => "mark_ready",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
