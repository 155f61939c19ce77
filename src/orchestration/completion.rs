//! Completion handles for submitted tasks.
//!
//! Callers that need to wait on a task ask the orchestrator for a
//! [`CompletionHandle`]; the orchestrator resolves every handle for a task
//! once it reaches a terminal outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{ConductorError, Result};
use crate::models::TaskId;

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: Option<Value> },
    Failed { error: String },
    Cancelled,
}

#[derive(Debug)]
pub struct CompletionHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl CompletionHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait without a deadline
    pub async fn outcome(self) -> Result<TaskOutcome> {
        let task_id = self.task_id;
        self.receiver.await.map_err(|_| {
            ConductorError::Internal(format!("Completion for task {task_id} was abandoned"))
        })
    }

    /// Wait at most `timeout` for the task to finish
    pub async fn wait(self, timeout: Duration) -> Result<TaskOutcome> {
        let task_id = self.task_id.clone();
        match tokio::time::timeout(timeout, self.outcome()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConductorError::Timeout(format!(
                "Task {task_id} did not finish within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompletionRegistry {
    watchers: HashMap<TaskId, Vec<oneshot::Sender<TaskOutcome>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, task_id: &str) -> CompletionHandle {
        let (sender, receiver) = oneshot::channel();
        self.watchers
            .entry(task_id.to_string())
            .or_default()
            .push(sender);
        CompletionHandle {
            task_id: task_id.to_string(),
            receiver,
        }
    }

    /// Handle that is already resolved
    pub fn resolved(task_id: &str, outcome: TaskOutcome) -> CompletionHandle {
        let (sender, receiver) = oneshot::channel();
        // Receiver is alive, send cannot fail
        let _ = sender.send(outcome);
        CompletionHandle {
            task_id: task_id.to_string(),
            receiver,
        }
    }

    /// Resolve every watcher of `task_id`, returning how many were still listening
    pub fn resolve(&mut self, task_id: &str, outcome: &TaskOutcome) -> usize {
        self.watchers
            .remove(task_id)
            .unwrap_or_default()
            .into_iter()
            .map(|sender| sender.send(outcome.clone()).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }

    pub fn pending(&self) -> usize {
        self.watchers.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_all_watchers() {
        let mut registry = CompletionRegistry::new();
        let first = registry.watch("t1");
        let second = registry.watch("t1");
        assert_eq!(registry.pending(), 2);

        let outcome = TaskOutcome::Completed { result: None };
        assert_eq!(registry.resolve("t1", &outcome), 2);
        assert_eq!(first.outcome().await.unwrap(), outcome);
        assert_eq!(second.wait(Duration::from_secs(1)).await.unwrap(), outcome);
        assert_eq!(registry.resolve("t1", &outcome), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let mut registry = CompletionRegistry::new();
        let handle = registry.watch("slow");

        let error = handle.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(error, ConductorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cleared_registry_abandons_handles() {
        let mut registry = CompletionRegistry::new();
        let handle = registry.watch("t1");
        registry.clear();
        assert!(matches!(
            handle.outcome().await,
            Err(ConductorError::Internal(_))
        ));
    }
}
