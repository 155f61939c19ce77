//! Builders shared by the integration tests

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use conductor_core::config::{ConductorConfig, SchedulerConfig};
use conductor_core::execution::{ConnectionPool, PoolSettings};
use conductor_core::messaging::{InMemoryMessageStore, MessageRouter, DELIVERY_BREAKER};
use conductor_core::metrics::{InMemoryMetrics, Metrics};
use conductor_core::models::{NewTask, Task, TaskPriority};
use conductor_core::orchestration::TaskQueue;
use conductor_core::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryManager};
use conductor_core::state_machine::TaskStatus;

/// Config bound to an ephemeral port with short timeouts
pub fn test_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.server.graceful_shutdown_timeout_ms = 200;
    config.events.debounce_ms = 10;
    config.retry.max_attempts = 1;
    config
}

pub fn task_queue() -> TaskQueue {
    TaskQueue::new(SchedulerConfig::default(), Metrics::noop())
}

pub fn task_queue_with_metrics() -> (TaskQueue, Arc<InMemoryMetrics>) {
    let sink = Arc::new(InMemoryMetrics::new());
    let queue = TaskQueue::new(SchedulerConfig::default(), Metrics::new(sink.clone()));
    (queue, sink)
}

pub fn named(id: &str) -> NewTask {
    NewTask::new(format!("task {id}")).with_id(id)
}

pub fn prioritized(id: &str, priority: TaskPriority) -> NewTask {
    named(id).with_priority(priority)
}

/// A task already in `status`, created at `created_ms` epoch milliseconds
pub fn task_at(id: &str, priority: i64, created_ms: i64, status: TaskStatus) -> Task {
    let mut task = Task::new(id, format!("task {id}"));
    task.numeric_priority = Some(priority);
    task.created_at = timestamp(created_ms);
    task.status = status;
    task
}

pub fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub fn router_fixture(max_messages: usize) -> (MessageRouter, Arc<ConnectionPool>) {
    let pool = Arc::new(ConnectionPool::new(PoolSettings::default(), Metrics::noop()));
    let router = MessageRouter::new(
        "conductor",
        100,
        pool.clone(),
        Arc::new(InMemoryMessageStore::new(max_messages, max_messages)),
        Arc::new(CircuitBreaker::new(
            DELIVERY_BREAKER,
            CircuitBreakerConfig::default(),
        )),
        RetryManager::new(
            DELIVERY_BREAKER,
            RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                ..RetryConfig::default()
            },
        ),
        Metrics::noop(),
    );
    (router, pool)
}
