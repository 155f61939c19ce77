use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskStatus,
};
use crate::models::{Task, TaskId};

/// One audited status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub event: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Guard over task status mutation
///
/// Knows nothing about priority or dependencies. Every accepted transition
/// is appended to a per-task history for audit.
#[derive(Debug, Default)]
pub struct TaskStateMachine {
    history: HashMap<TaskId, Vec<TransitionRecord>>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full legal transition table
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Created, Validated)
                | (Validated, Ready)
                | (Ready, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Failed, Ready)
                | (Failed, InProgress)
                // Queued tasks may be withdrawn before dispatch
                | (Created, Cancelled)
                | (Validated, Cancelled)
                | (Ready, Cancelled)
        )
    }

    /// Determine the target status based on current status and event
    pub fn determine_target_state(
        &self,
        task_id: &str,
        current: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        use TaskStatus::*;
        let target = match (current, event) {
            (Created, TaskEvent::Validate) => Validated,
            (Validated, TaskEvent::MarkReady) => Ready,
            (Ready, TaskEvent::Start) | (Failed, TaskEvent::Start) => InProgress,
            (InProgress, TaskEvent::Complete) => Completed,
            (InProgress, TaskEvent::Fail(_)) => Failed,
            (Created | Validated | Ready | InProgress, TaskEvent::Cancel) => Cancelled,
            (Failed, TaskEvent::Retry) => Ready,
            (current, event) => {
                return Err(StateMachineError::InvalidEvent {
                    task_id: task_id.to_string(),
                    event: event.event_type().to_string(),
                    current,
                })
            }
        };
        Ok(target)
    }

    /// Apply an event to the task, mutating its status on success
    pub fn apply(&mut self, task: &mut Task, event: TaskEvent) -> StateMachineResult<TaskStatus> {
        let target = self.determine_target_state(&task.id, task.status, &event)?;
        let reason = event.error_message().map(str::to_string);
        self.commit(task, target, event.event_type(), reason)?;
        Ok(target)
    }

    /// Move the task directly to `target` if the table allows it
    pub fn transition(
        &mut self,
        task: &mut Task,
        target: TaskStatus,
    ) -> StateMachineResult<TransitionRecord> {
        self.commit(task, target, "transition", None)
    }

    fn commit(
        &mut self,
        task: &mut Task,
        target: TaskStatus,
        event: &str,
        reason: Option<String>,
    ) -> StateMachineResult<TransitionRecord> {
        let from = task.status;
        if !Self::is_valid_transition(from, target) {
            return Err(StateMachineError::InvalidTransition {
                task_id: task.id.clone(),
                from,
                to: target,
            });
        }

        let record = TransitionRecord {
            task_id: task.id.clone(),
            from,
            to: target,
            event: event.to_string(),
            reason,
            at: Utc::now(),
        };

        task.status = target;
        if target == TaskStatus::Completed {
            task.completed_at = Some(record.at);
        }

        debug!(
            task_id = %task.id,
            from = %from,
            to = %target,
            event = event,
            "🔄 Task transition"
        );

        self.history
            .entry(task.id.clone())
            .or_default()
            .push(record.clone());

        Ok(record)
    }

    pub fn history(&self, task_id: &str) -> &[TransitionRecord] {
        self.history
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn forget(&mut self, task_id: &str) {
        self.history.remove(task_id);
    }

    pub fn tracked_tasks(&self) -> usize {
        self.history.len()
    }

    pub fn dispose(&mut self) {
        self.history.clear();
    }
}
