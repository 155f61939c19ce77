//! # Orchestration Engine
//!
//! Scheduling core of the conductor.
//!
//! ## Core Components
//!
//! - **PriorityTaskQueue**: dual max-heap (ready / validated) with O(log n)
//!   removal and priority updates through an id-to-position index
//! - **TaskDependencyManager**: acyclic hard-dependency graph gating readiness
//! - **TaskQueue**: the orchestrator; reacts to submissions, worker
//!   availability, completions and failures, and emits assignments
//! - **CompletionHandle**: awaitable terminal outcome of a submitted task

pub mod completion;
pub mod dependency_manager;
pub mod priority_queue;
pub mod task_queue;

pub use completion::{CompletionHandle, CompletionRegistry, TaskOutcome};
pub use dependency_manager::{DependencyError, DependencyResult, TaskDependencyManager};
pub use priority_queue::{HeapKind, PriorityTaskQueue, SOFT_DEPENDENCY_BONUS};
pub use task_queue::{Assignment, QueueEffect, QueueStats, TaskQueue};
