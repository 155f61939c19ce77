use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Submitted, not yet checked
    #[default]
    Created,
    /// Accepted but waiting on hard dependencies
    Validated,
    /// Dependencies satisfied, eligible for dispatch
    Ready,
    /// Assigned to a worker
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// No further transitions allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Statuses allowed to sit in a scheduler heap
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Ready | Self::Validated)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Validated => write!(f, "validated"),
            Self::Ready => write!(f, "ready"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "validated" => Ok(Self::Validated),
            "ready" => Ok(Self::Ready),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}
