//! # Task Dependency Manager
//!
//! Owns the hard-dependency graph. An edge `from -> to` means `from` cannot
//! become ready until `to` has completed. The graph is kept acyclic: an edge
//! that would close a cycle is rejected before anything is mutated.

use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ConductorError;
use crate::models::{Task, TaskId};
use crate::state_machine::TaskStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DependencyError {
    #[error("Adding dependency {from} -> {to} would create a cycle")]
    Cycle { from: TaskId, to: TaskId },

    #[error("Task {0} cannot depend on itself")]
    SelfDependency(TaskId),
}

pub type DependencyResult<T> = Result<T, DependencyError>;

impl From<DependencyError> for ConductorError {
    fn from(error: DependencyError) -> Self {
        ConductorError::DependencyCycle(error.to_string())
    }
}

#[derive(Debug, Default)]
pub struct TaskDependencyManager {
    /// task -> tasks it waits on
    dependencies: HashMap<TaskId, HashSet<TaskId>>,
    /// task -> tasks waiting on it
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl TaskDependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` depends on `to`
    pub fn add_dependency(&mut self, from: &str, to: &str) -> DependencyResult<()> {
        if from == to {
            return Err(DependencyError::SelfDependency(from.to_string()));
        }
        if self.has_edge(from, to) {
            return Ok(());
        }
        if self.would_create_cycle(from, to) {
            warn!(from = from, to = to, "🔁 Rejected dependency edge that closes a cycle");
            return Err(DependencyError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.dependencies
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.dependents
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());

        debug!(from = from, to = to, "🔗 Dependency added");
        Ok(())
    }

    /// Add all of a task's dependencies, or none of them
    pub fn add_dependencies<'a, I>(&mut self, task_id: &str, targets: I) -> DependencyResult<()>
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let mut added: Vec<&TaskId> = Vec::new();
        for target in targets {
            let existed = self.has_edge(task_id, target);
            if let Err(error) = self.add_dependency(task_id, target) {
                for previous in added {
                    self.remove_dependency(task_id, previous);
                }
                return Err(error);
            }
            if !existed {
                added.push(target);
            }
        }
        Ok(())
    }

    pub fn remove_dependency(&mut self, from: &str, to: &str) -> bool {
        let removed = remove_edge(&mut self.dependencies, from, to);
        remove_edge(&mut self.dependents, to, from);
        removed
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.dependencies
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// DFS from `to` along dependency edges looking for `from`
    pub fn would_create_cycle(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut stack = vec![to];
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = self.dependencies.get(current) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
        false
    }

    /// Every hard dependency has completed
    pub fn is_ready(&self, task: &Task, all_tasks: &HashMap<TaskId, Task>) -> bool {
        task.depends_on.iter().all(|dependency| {
            all_tasks
                .get(dependency)
                .is_some_and(|dep| dep.status.satisfies_dependencies())
        })
    }

    pub fn unmet_dependencies(&self, task: &Task, all_tasks: &HashMap<TaskId, Task>) -> Vec<TaskId> {
        task.depends_on
            .iter()
            .filter(|dependency| {
                !all_tasks
                    .get(dependency.as_str())
                    .is_some_and(|dep| dep.status.satisfies_dependencies())
            })
            .cloned()
            .collect()
    }

    /// Dependents of `completed_id` that are still waiting and now fully unblocked
    pub fn on_task_completed(
        &self,
        completed_id: &str,
        all_tasks: &HashMap<TaskId, Task>,
    ) -> Vec<TaskId> {
        let Some(waiting) = self.dependents.get(completed_id) else {
            return Vec::new();
        };

        let mut newly_ready: Vec<TaskId> = waiting
            .iter()
            .filter_map(|id| all_tasks.get(id))
            .filter(|task| task.status == TaskStatus::Validated)
            .filter(|task| self.is_ready(task, all_tasks))
            .map(|task| task.id.clone())
            .collect();
        newly_ready.sort();

        if !newly_ready.is_empty() {
            debug!(
                completed = completed_id,
                unblocked = ?newly_ready,
                "🔓 Dependents unblocked"
            );
        }
        newly_ready
    }

    pub fn dependencies_of(&self, task_id: &str) -> Vec<TaskId> {
        sorted(self.dependencies.get(task_id))
    }

    pub fn dependents_of(&self, task_id: &str) -> Vec<TaskId> {
        sorted(self.dependents.get(task_id))
    }

    /// Drop every edge touching `task_id`
    pub fn remove_task(&mut self, task_id: &str) {
        if let Some(targets) = self.dependencies.remove(task_id) {
            for target in targets {
                remove_edge(&mut self.dependents, &target, task_id);
            }
        }
        if let Some(waiting) = self.dependents.remove(task_id) {
            for dependent in waiting {
                remove_edge(&mut self.dependencies, &dependent, task_id);
            }
        }
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(HashSet::len).sum()
    }

    pub fn dispose(&mut self) {
        self.dependencies.clear();
        self.dependents.clear();
    }
}

fn remove_edge(map: &mut HashMap<TaskId, HashSet<TaskId>>, key: &str, value: &str) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

fn sorted(set: Option<&HashSet<TaskId>>) -> Vec<TaskId> {
    let mut values: Vec<TaskId> = set.into_iter().flatten().cloned().collect();
    values.sort();
    values
}
