//! # Task Model
//!
//! A unit of work scheduled onto an agent. Status changes go exclusively
//! through [`crate::state_machine::TaskStateMachine`]; the orchestrator owns
//! every `Task` instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::state_machine::TaskStatus;

pub type TaskId = String;

/// Priority tier; `numeric_priority` on the task overrides the tier value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn value(&self) -> i64 {
        match self {
            Self::Low => 10,
            Self::Medium => 20,
            Self::High => 30,
            Self::Critical => 40,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub numeric_priority: Option<i64>,
    pub status: TaskStatus,
    /// Hard dependencies: must be `completed` before this task is ready
    pub depends_on: Vec<TaskId>,
    /// Soft dependencies: only adjust scheduling priority
    pub prefers: Vec<TaskId>,
    pub required_capabilities: Vec<String>,
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Dispatches so far, including retries
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            priority: TaskPriority::default(),
            numeric_priority: None,
            status: TaskStatus::Created,
            depends_on: Vec::new(),
            prefers: Vec::new(),
            required_capabilities: Vec::new(),
            assigned_worker: None,
            created_at: Utc::now(),
            completed_at: None,
            attempts: 0,
            last_error: None,
            result: None,
        }
    }

    /// Tier value, unless a numeric override is present
    pub fn base_priority(&self) -> i64 {
        self.numeric_priority.unwrap_or_else(|| self.priority.value())
    }

    /// Whether a worker declaring `capabilities` may run this task
    pub fn is_runnable_by(&self, capabilities: &HashSet<String>) -> bool {
        self.required_capabilities
            .iter()
            .all(|required| capabilities.contains(required))
    }
}

/// Submission request; the orchestrator turns it into a [`Task`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub numeric_priority: Option<i64>,
    pub depends_on: Vec<TaskId>,
    pub prefers: Vec<TaskId>,
    pub required_capabilities: Vec<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_numeric_priority(mut self, priority: i64) -> Self {
        self.numeric_priority = Some(priority);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<TaskId>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    pub fn prefers(mut self, task_id: impl Into<TaskId>) -> Self {
        self.prefers.push(task_id.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Check the request shape and build a `created` task
    pub fn into_task(self) -> Result<Task> {
        if self.title.trim().is_empty() {
            return Err(ConductorError::validation_field(
                "Task title cannot be empty",
                "title",
            ));
        }

        let id = match self.id {
            Some(id) if id.trim().is_empty() => {
                return Err(ConductorError::validation_field(
                    "Task id cannot be empty",
                    "id",
                ))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        if self.depends_on.iter().any(|dep| dep == &id) {
            return Err(ConductorError::validation_field(
                format!("Task {id} cannot depend on itself"),
                "dependsOn",
            ));
        }

        let mut task = Task::new(id, self.title);
        task.description = self.description;
        task.priority = self.priority;
        task.numeric_priority = self.numeric_priority;
        task.depends_on = dedup(self.depends_on);
        task.prefers = dedup(self.prefers);
        task.required_capabilities = dedup(self.required_capabilities);
        Ok(task)
    }
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_priority_overrides_tier() {
        let mut task = Task::new("t1", "build");
        task.priority = TaskPriority::High;
        assert_eq!(task.base_priority(), 30);

        task.numeric_priority = Some(5);
        assert_eq!(task.base_priority(), 5);
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::new("  ").into_task().is_err());
        assert!(NewTask::new("x").with_id("a").depends_on("a").into_task().is_err());

        let task = NewTask::new("deploy")
            .depends_on("build")
            .depends_on("build")
            .requires("docker")
            .into_task()
            .unwrap();
        assert_eq!(task.depends_on, vec!["build".to_string()]);
        assert_eq!(task.status, TaskStatus::Created);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_capability_matching() {
        let task = NewTask::new("x").requires("gpu").into_task().unwrap();
        let mut caps = HashSet::new();
        assert!(!task.is_runnable_by(&caps));
        caps.insert("gpu".to_string());
        assert!(task.is_runnable_by(&caps));
    }

    #[test]
    fn test_new_task_deserializes_camel_case() {
        let json = r#"{"title":"ship","priority":"critical","dependsOn":["a"],"requiredCapabilities":["rust"]}"#;
        let new_task: NewTask = serde_json::from_str(json).unwrap();
        assert_eq!(new_task.priority, TaskPriority::Critical);
        assert_eq!(new_task.depends_on, vec!["a".to_string()]);
        assert_eq!(new_task.required_capabilities, vec!["rust".to_string()]);
    }
}
