//! # Task Queue Orchestrator
//!
//! Composes the state machine, the dependency manager and the priority queue
//! with worker availability. All mutation happens through `&mut self`; the
//! server drives it from a single core loop, so every operation observes and
//! leaves a consistent view of tasks, heaps and index maps.
//!
//! Side effects that leave the orchestrator (assignment messages,
//! cancellation notices, domain events) are buffered as [`QueueEffect`]s
//! and drained by the caller with [`TaskQueue::drain_effects`].

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::completion::{CompletionHandle, CompletionRegistry, TaskOutcome};
use super::dependency_manager::TaskDependencyManager;
use super::priority_queue::PriorityTaskQueue;
use crate::config::SchedulerConfig;
use crate::constants::{events, metrics};
use crate::error::{ConductorError, Result};
use crate::logging::{log_error, log_task_operation};
use crate::metrics::Metrics;
use crate::models::{NewTask, Task, TaskId};
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus, TransitionRecord};

/// A task handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker_id: String,
    pub task: Task,
}

/// Work the orchestrator asks its owner to carry out
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEffect {
    Assign(Assignment),
    Cancel { task_id: TaskId, worker_id: String },
    Event { topic: &'static str, payload: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_tasks: usize,
    pub validated: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queued_ready: usize,
    pub queued_validated: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
}

#[derive(Debug)]
pub struct TaskQueue {
    config: SchedulerConfig,
    tasks: HashMap<TaskId, Task>,
    state_machine: TaskStateMachine,
    dependencies: TaskDependencyManager,
    queue: PriorityTaskQueue,
    idle_workers: VecDeque<String>,
    capabilities: HashMap<String, HashSet<String>>,
    /// worker -> task it is running
    in_flight: HashMap<String, TaskId>,
    /// Terminal tasks, oldest first, eligible for pruning
    retired: VecDeque<TaskId>,
    completions: CompletionRegistry,
    effects: Vec<QueueEffect>,
    metrics: Metrics,
    disposed: bool,
}

impl TaskQueue {
    pub fn new(config: SchedulerConfig, metrics: Metrics) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            state_machine: TaskStateMachine::new(),
            dependencies: TaskDependencyManager::new(),
            queue: PriorityTaskQueue::new(),
            idle_workers: VecDeque::new(),
            capabilities: HashMap::new(),
            in_flight: HashMap::new(),
            retired: VecDeque::new(),
            completions: CompletionRegistry::new(),
            effects: Vec::new(),
            metrics,
            disposed: false,
        }
    }

    /// Admit a task: validate, evaluate readiness, enqueue, then try to dispatch
    pub fn submit(&mut self, request: NewTask) -> Result<TaskId> {
        self.ensure_active()?;
        let mut task = request.into_task()?;

        if self.tasks.contains_key(&task.id) {
            return Err(ConductorError::validation_field(
                format!("Task {} already exists", task.id),
                "id",
            ));
        }
        if let Some(missing) = task
            .depends_on
            .iter()
            .find(|dependency| !self.tasks.contains_key(dependency.as_str()))
        {
            return Err(ConductorError::validation_field(
                format!("Task {} depends on unknown task {missing}", task.id),
                "dependsOn",
            ));
        }

        self.dependencies.add_dependencies(&task.id, &task.depends_on)?;
        if let Err(error) = self.admit(&mut task) {
            self.dependencies.remove_task(&task.id);
            return Err(error);
        }

        let task_id = task.id.clone();
        let status = task.status;
        let priority = PriorityTaskQueue::compute_effective_priority(&task, &self.tasks);
        self.queue.enqueue_with_priority(&task, priority);

        let payload = json!({
            "taskId": task_id,
            "title": task.title,
            "status": status,
            "priority": priority,
        });
        self.tasks.insert(task_id.clone(), task);

        self.metrics.increment(metrics::TASKS_CREATED);
        log_task_operation("submit", &task_id, None, &status.to_string(), None);
        self.emit(events::TASK_SUBMITTED, payload);

        if status == TaskStatus::Ready {
            self.emit(events::TASK_READY, json!({ "taskId": task_id }));
            self.dispatch();
        }
        Ok(task_id)
    }

    fn admit(&mut self, task: &mut Task) -> Result<()> {
        self.state_machine.apply(task, TaskEvent::Validate)?;
        if self.dependencies.is_ready(task, &self.tasks) {
            self.state_machine.apply(task, TaskEvent::MarkReady)?;
        }
        Ok(())
    }

    /// Mark a worker idle and hand it the best task it can run
    ///
    /// Returns the number of assignments made. A worker that re-announces
    /// itself while still holding a task loses that task to a retry.
    pub fn worker_available<I, S>(&mut self, worker_id: &str, capabilities: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.disposed {
            return 0;
        }

        if let Some(task_id) = self.in_flight.get(worker_id).cloned() {
            warn!(
                worker_id = worker_id,
                task_id = %task_id,
                "⚠️ Worker reported ready while still holding a task"
            );
            let reason = format!("Worker {worker_id} re-registered before finishing");
            if let Err(error) = self.record_failure(&task_id, &reason, true) {
                log_error("task_queue", "worker_available", &error.to_string(), Some(worker_id));
            }
        }

        self.capabilities.insert(
            worker_id.to_string(),
            capabilities.into_iter().map(Into::into).collect(),
        );
        self.mark_idle(worker_id);
        self.dispatch()
    }

    /// Pair idle workers with the highest-priority ready task each can run
    fn dispatch(&mut self) -> usize {
        let mut assigned = 0;
        let mut index = 0;
        let no_capabilities = HashSet::new();

        while index < self.idle_workers.len() && self.queue.ready_len() > 0 {
            let worker_id = self.idle_workers[index].clone();
            let tasks = &self.tasks;
            let capabilities = self.capabilities.get(&worker_id).unwrap_or(&no_capabilities);

            let picked = self.queue.dequeue_ready_where(|task_id| {
                tasks
                    .get(task_id)
                    .is_some_and(|task| task.is_runnable_by(capabilities))
            });

            let Some(task_id) = picked else {
                index += 1;
                continue;
            };

            self.idle_workers.remove(index);
            match self.start_task(&task_id, &worker_id) {
                Ok(()) => assigned += 1,
                Err(error) => {
                    log_error("task_queue", "dispatch", &error.to_string(), Some(&task_id));
                    self.idle_workers.insert(index, worker_id);
                }
            }
        }

        if assigned == 0 {
            debug!(
                idle_workers = self.idle_workers.len(),
                ready = self.queue.ready_len(),
                "No dispatchable work"
            );
        }
        assigned
    }

    fn start_task(&mut self, task_id: &str, worker_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::Internal(format!("Task {task_id} vanished")))?;

        self.state_machine.apply(task, TaskEvent::Start)?;
        task.assigned_worker = Some(worker_id.to_string());
        task.attempts += 1;
        let snapshot = task.clone();

        self.in_flight
            .insert(worker_id.to_string(), task_id.to_string());
        self.metrics.increment(metrics::TASKS_ASSIGNED);
        log_task_operation("assign", task_id, Some(worker_id), "in-progress", None);

        self.emit(
            events::TASK_ASSIGNED,
            json!({
                "taskId": task_id,
                "workerId": worker_id,
                "attempt": snapshot.attempts,
            }),
        );
        self.effects.push(QueueEffect::Assign(Assignment {
            worker_id: worker_id.to_string(),
            task: snapshot,
        }));
        Ok(())
    }

    /// Worker acknowledged an assignment
    pub fn task_accepted(&mut self, task_id: &str, worker_id: &str) -> Result<()> {
        self.ensure_active()?;
        let task = self.ensure_assigned(task_id, worker_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(ConductorError::IllegalTransition(format!(
                "Task {task_id} cannot be accepted in status {}",
                task.status
            )));
        }
        log_task_operation("accept", task_id, Some(worker_id), "in-progress", None);
        Ok(())
    }

    /// Record a successful completion; returns dependents that became ready
    pub fn complete_task(
        &mut self,
        task_id: &str,
        worker_id: &str,
        result: Option<Value>,
    ) -> Result<Vec<TaskId>> {
        self.ensure_active()?;
        self.ensure_assigned(task_id, worker_id)?;

        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::Internal(format!("Task {task_id} vanished")))?;
        self.state_machine.apply(task, TaskEvent::Complete)?;
        task.result = result;
        let outcome = TaskOutcome::Completed {
            result: task.result.clone(),
        };

        self.in_flight.remove(worker_id);
        self.metrics.increment(metrics::TASKS_COMPLETED);
        log_task_operation("complete", task_id, Some(worker_id), "completed", None);
        self.emit(
            events::TASK_COMPLETED,
            json!({ "taskId": task_id, "workerId": worker_id }),
        );
        self.completions.resolve(task_id, &outcome);

        let newly_ready = self.dependencies.on_task_completed(task_id, &self.tasks);
        for dependent in &newly_ready {
            self.promote(dependent);
        }
        self.refresh_soft_dependents(task_id);

        self.mark_idle(worker_id);
        self.dispatch();
        self.retire(task_id);
        Ok(newly_ready)
    }

    /// Record a failure reported by the worker; returns the task's resulting status
    pub fn fail_task(
        &mut self,
        task_id: &str,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<TaskStatus> {
        self.ensure_active()?;
        self.ensure_assigned(task_id, worker_id)?;

        let status = self.record_failure(task_id, error, retryable)?;
        self.mark_idle(worker_id);
        self.dispatch();
        Ok(status)
    }

    /// Manually retry a task that exhausted its automatic retries
    pub fn retry_task(&mut self, task_id: &str) -> Result<TaskStatus> {
        self.ensure_active()?;
        let task = self.get_known(task_id)?;
        if task.status != TaskStatus::Failed {
            return Err(ConductorError::IllegalTransition(format!(
                "Task {task_id} is {} and cannot be retried",
                task.status
            )));
        }
        self.retired.retain(|retired| retired != task_id);
        self.retry_failed(task_id)
    }

    /// Drop a finished task along with its history and dependency edges
    ///
    /// Tasks that unfinished dependents still wait on are kept.
    pub fn forget(&mut self, task_id: &str) -> Result<()> {
        self.ensure_active()?;
        let task = self.get_known(task_id)?;
        if !task.status.is_terminal() && task.status != TaskStatus::Failed {
            return Err(ConductorError::IllegalTransition(format!(
                "Task {task_id} is {} and cannot be forgotten",
                task.status
            )));
        }
        if self.has_live_dependents(task_id) {
            return Err(ConductorError::validation_field(
                format!("Task {task_id} still has unfinished dependents"),
                "taskId",
            ));
        }
        self.retired.retain(|retired| retired != task_id);
        self.remove_task(task_id);
        Ok(())
    }

    /// Withdraw a queued or running task
    pub fn cancel_task(&mut self, task_id: &str) -> Result<()> {
        self.ensure_active()?;
        let task = self.tasks.get_mut(task_id).ok_or_else(|| unknown_task(task_id))?;
        let previous = task.status;
        self.state_machine.apply(task, TaskEvent::Cancel)?;

        let worker = match previous {
            TaskStatus::InProgress => task.assigned_worker.clone(),
            _ => None,
        };
        self.queue.remove(task_id);

        self.metrics.increment(metrics::TASKS_CANCELLED);
        log_task_operation("cancel", task_id, worker.as_deref(), "cancelled", None);
        self.emit(events::TASK_CANCELLED, json!({ "taskId": task_id }));
        self.completions.resolve(task_id, &TaskOutcome::Cancelled);

        if let Some(worker_id) = worker {
            self.in_flight.remove(&worker_id);
            self.effects.push(QueueEffect::Cancel {
                task_id: task_id.to_string(),
                worker_id: worker_id.clone(),
            });
            self.mark_idle(&worker_id);
            self.dispatch();
        }
        self.retire(task_id);
        Ok(())
    }

    /// A worker's connection went away; its running task is retried elsewhere
    pub fn worker_lost(&mut self, worker_id: &str) -> Option<TaskId> {
        if self.disposed {
            return None;
        }
        self.idle_workers.retain(|idle| idle != worker_id);
        self.capabilities.remove(worker_id);

        let task_id = self.in_flight.get(worker_id).cloned()?;
        info!(worker_id = worker_id, task_id = %task_id, "💀 Worker lost with task in flight");

        let reason = format!("Worker {worker_id} disconnected");
        if let Err(error) = self.record_failure(&task_id, &reason, true) {
            log_error("task_queue", "worker_lost", &error.to_string(), Some(&task_id));
        }
        Some(task_id)
    }

    /// Override a task's numeric priority and reposition it if queued
    pub fn set_priority(&mut self, task_id: &str, priority: i64) -> Result<()> {
        self.ensure_active()?;
        let task = self.tasks.get_mut(task_id).ok_or_else(|| unknown_task(task_id))?;
        task.numeric_priority = Some(priority);
        self.queue.recompute_priority(task_id, &self.tasks);
        Ok(())
    }

    /// Rebuild the heaps after bulk priority changes
    pub fn reorder(&mut self) {
        self.queue.reorder(&self.tasks);
    }

    /// Handle resolving once the task reaches a terminal outcome
    pub fn watch_completion(&mut self, task_id: &str) -> Result<CompletionHandle> {
        let task = self.tasks.get(task_id).ok_or_else(|| unknown_task(task_id))?;
        let handle = match task.status {
            TaskStatus::Completed => CompletionRegistry::resolved(
                task_id,
                TaskOutcome::Completed {
                    result: task.result.clone(),
                },
            ),
            TaskStatus::Failed => CompletionRegistry::resolved(
                task_id,
                TaskOutcome::Failed {
                    error: task.last_error.clone().unwrap_or_default(),
                },
            ),
            TaskStatus::Cancelled => CompletionRegistry::resolved(task_id, TaskOutcome::Cancelled),
            _ => self.completions.watch(task_id),
        };
        Ok(handle)
    }

    pub fn drain_effects(&mut self) -> Vec<QueueEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn history(&self, task_id: &str) -> &[TransitionRecord] {
        self.state_machine.history(task_id)
    }

    pub fn assigned_task(&self, worker_id: &str) -> Option<&TaskId> {
        self.in_flight.get(worker_id)
    }

    pub fn idle_workers(&self) -> Vec<String> {
        self.idle_workers.iter().cloned().collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn subtask_timeout(&self) -> Duration {
        self.config.subtask_timeout()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total_tasks: self.tasks.len(),
            queued_ready: self.queue.ready_len(),
            queued_validated: self.queue.validated_len(),
            idle_workers: self.idle_workers.len(),
            busy_workers: self.in_flight.len(),
            ..QueueStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Created => {}
                TaskStatus::Validated => stats.validated += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Drop all state; pending completion handles resolve with an error
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.tasks.clear();
        self.state_machine.dispose();
        self.dependencies.dispose();
        self.queue.dispose();
        self.idle_workers.clear();
        self.capabilities.clear();
        self.in_flight.clear();
        self.retired.clear();
        self.completions.clear();
        self.effects.clear();
        self.disposed = true;
        info!("🛑 Task queue disposed");
    }

    /// Fail a running task and retry it if policy allows
    fn record_failure(&mut self, task_id: &str, error: &str, retryable: bool) -> Result<TaskStatus> {
        let task = self.tasks.get_mut(task_id).ok_or_else(|| unknown_task(task_id))?;
        self.state_machine
            .apply(task, TaskEvent::fail_with_error(error))?;
        task.last_error = Some(error.to_string());
        let worker = task.assigned_worker.take();
        let attempts = task.attempts;

        if let Some(worker_id) = &worker {
            self.in_flight.remove(worker_id);
        }
        self.metrics.increment(metrics::TASKS_FAILED);

        let will_retry = retryable && attempts <= self.config.max_retries;
        log_task_operation("fail", task_id, worker.as_deref(), "failed", Some(error));
        self.emit(
            events::TASK_FAILED,
            json!({
                "taskId": task_id,
                "error": error,
                "attempts": attempts,
                "retrying": will_retry,
            }),
        );

        if will_retry {
            return self.retry_failed(task_id);
        }

        self.completions.resolve(
            task_id,
            &TaskOutcome::Failed {
                error: error.to_string(),
            },
        );
        self.retire(task_id);
        Ok(TaskStatus::Failed)
    }

    /// Dispatch straight to an idle capable worker, else back to the ready heap
    fn retry_failed(&mut self, task_id: &str) -> Result<TaskStatus> {
        let task = self.get_known(task_id)?;
        let no_capabilities = HashSet::new();
        let idle_match = self.idle_workers.iter().position(|worker_id| {
            task.is_runnable_by(self.capabilities.get(worker_id).unwrap_or(&no_capabilities))
        });

        if let Some(position) = idle_match {
            if let Some(worker_id) = self.idle_workers.remove(position) {
                self.start_task(task_id, &worker_id)?;
                return Ok(TaskStatus::InProgress);
            }
        }

        let task = self.tasks.get_mut(task_id).ok_or_else(|| unknown_task(task_id))?;
        self.state_machine.apply(task, TaskEvent::Retry)?;
        let task = self.tasks.get(task_id).ok_or_else(|| unknown_task(task_id))?;
        let priority = PriorityTaskQueue::compute_effective_priority(task, &self.tasks);
        self.queue.enqueue_with_priority(task, priority);
        self.emit(events::TASK_READY, json!({ "taskId": task_id, "retry": true }));
        Ok(TaskStatus::Ready)
    }

    /// Move an unblocked dependent from the validated heap to the ready heap
    fn promote(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if let Err(error) = self.state_machine.apply(task, TaskEvent::MarkReady) {
            log_error("task_queue", "promote", &error.to_string(), Some(task_id));
            return;
        }
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        let priority = PriorityTaskQueue::compute_effective_priority(task, &self.tasks);
        self.queue.enqueue_with_priority(task, priority);
        self.emit(events::TASK_READY, json!({ "taskId": task_id }));
    }

    fn refresh_soft_dependents(&mut self, completed_id: &str) {
        let affected: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.prefers.iter().any(|id| id == completed_id))
            .filter(|task| self.queue.contains(&task.id))
            .map(|task| task.id.clone())
            .collect();
        for task_id in affected {
            self.queue.recompute_priority(&task_id, &self.tasks);
        }
    }

    /// Record a terminal task and prune the oldest beyond the retention bound
    fn retire(&mut self, task_id: &str) {
        self.retired.push_back(task_id.to_string());

        let mut excess = self
            .retired
            .len()
            .saturating_sub(self.config.max_terminal_tasks);
        let mut pinned = VecDeque::new();
        while excess > 0 {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            if self.has_live_dependents(&oldest) {
                pinned.push_back(oldest);
                continue;
            }
            self.remove_task(&oldest);
            excess -= 1;
        }
        pinned.append(&mut self.retired);
        self.retired = pinned;
    }

    fn has_live_dependents(&self, task_id: &str) -> bool {
        self.dependencies
            .dependents_of(task_id)
            .iter()
            .filter_map(|dependent| self.tasks.get(dependent))
            .any(|dependent| !dependent.status.is_terminal())
    }

    fn remove_task(&mut self, task_id: &str) {
        self.tasks.remove(task_id);
        self.state_machine.forget(task_id);
        self.dependencies.remove_task(task_id);
        self.queue.remove(task_id);
        debug!(task_id = task_id, "🧹 Terminal task pruned");
    }

    fn mark_idle(&mut self, worker_id: &str) {
        let known = self.capabilities.contains_key(worker_id);
        let busy = self.in_flight.contains_key(worker_id);
        if known && !busy && !self.idle_workers.iter().any(|idle| idle == worker_id) {
            self.idle_workers.push_back(worker_id.to_string());
        }
    }

    fn emit(&mut self, topic: &'static str, payload: Value) {
        self.metrics.notify(topic, &payload);
        self.effects.push(QueueEffect::Event { topic, payload });
    }

    fn get_known(&self, task_id: &str) -> Result<&Task> {
        self.tasks.get(task_id).ok_or_else(|| unknown_task(task_id))
    }

    fn ensure_assigned(&self, task_id: &str, worker_id: &str) -> Result<&Task> {
        let task = self.get_known(task_id)?;
        if task.status == TaskStatus::InProgress
            && task.assigned_worker.as_deref() != Some(worker_id)
        {
            return Err(ConductorError::validation_field(
                format!("Task {task_id} is not assigned to {worker_id}"),
                "from",
            ));
        }
        Ok(task)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed {
            return Err(ConductorError::Internal("Task queue has been disposed".into()));
        }
        Ok(())
    }
}

fn unknown_task(task_id: &str) -> ConductorError {
    ConductorError::validation_field(format!("Unknown task {task_id}"), "taskId")
}
