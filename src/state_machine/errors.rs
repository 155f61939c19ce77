use thiserror::Error;

use super::TaskStatus;
use crate::error::ConductorError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid transition for task {task_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Event '{event}' is not applicable to task {task_id} in status {current}")]
    InvalidEvent {
        task_id: String,
        event: String,
        current: TaskStatus,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for ConductorError {
    fn from(error: StateMachineError) -> Self {
        ConductorError::IllegalTransition(error.to_string())
    }
}
