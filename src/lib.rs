#![allow(clippy::doc_markdown)] // Allow technical terms like TaskQueue, ConnectionPool in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conductor Core
//!
//! Coordination core for a central conductor driving a pool of long-running
//! agent processes over a persistent socket.
//!
//! ## Overview
//!
//! The conductor accepts agent connections, binds each to a stable logical id,
//! and hands out tasks in priority order as agents report idle. Tasks may
//! depend on each other; a task only becomes schedulable once every hard
//! dependency has completed. Messages to offline agents are kept in a bounded
//! history and replayed when they reconnect.
//!
//! ## Architecture
//!
//! All scheduling state is owned by one [`orchestration::TaskQueue`], mutated
//! from the server's single core loop. The queue never performs I/O itself; it
//! emits [`orchestration::QueueEffect`]s that the server turns into
//! `ASSIGN_TASK`/`TASK_CANCELLED` messages and bus events.
//!
//! ## Module Organization
//!
//! - [`models`] - Task data model and submission requests
//! - [`state_machine`] - Legal task lifecycle transitions with audit history
//! - [`orchestration`] - Dual-heap scheduler, dependency graph, task queue
//! - [`messaging`] - Wire protocol, validation, persistence and routing
//! - [`execution`] - TCP server, connection pool, worker launcher seam
//! - [`events`] - Topic pub/sub and debouncing
//! - [`resilience`] - Circuit breakers and retry with backoff
//! - [`metrics`] - Counter and notification sinks
//! - [`config`] - Layered configuration
//! - [`error`] - Crate-wide error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conductor_core::orchestration::TaskQueue;
//! use conductor_core::config::SchedulerConfig;
//! use conductor_core::metrics::Metrics;
//! use conductor_core::models::{NewTask, TaskPriority};
//!
//! # fn example() -> conductor_core::Result<()> {
//! let mut queue = TaskQueue::new(SchedulerConfig::default(), Metrics::noop());
//! let build = queue.submit(NewTask::new("build").with_priority(TaskPriority::High))?;
//! queue.submit(NewTask::new("deploy").depends_on(build.clone()))?;
//!
//! // `build` is assigned to the idle agent; `deploy` waits for it
//! queue.worker_available("agent-1", Vec::<String>::new());
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod state_machine;

pub use config::{ConductorConfig, ConfigManager};
pub use error::{ConductorError, Result};
pub use events::{EventBus, EventHandler};
pub use execution::{ConnectionPool, OrchestrationServer, WorkerLauncher};
pub use messaging::{Message, MessageRouter, MessageStore, MessageType};
pub use models::{NewTask, Task, TaskId, TaskPriority};
pub use orchestration::{PriorityTaskQueue, TaskDependencyManager, TaskQueue};
pub use state_machine::{TaskStateMachine, TaskStatus};
