//! # System Constants
//!
//! Event topics, metric counter names and operational defaults shared across
//! the conductor core.

/// Domain event topics published on the [`crate::events::EventBus`]
pub mod events {
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_READY: &str = "task.ready";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_PROGRESS: &str = "task.progress";

    pub const AGENT_CONNECTED: &str = "agent.connected";
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_DISCONNECTED: &str = "agent.disconnected";
    pub const AGENT_STATUS: &str = "agent.status";

    pub const MESSAGE_ROUTED: &str = "message.routed";
    pub const MESSAGE_REJECTED: &str = "message.rejected";
}

/// Counter names reported to the [`crate::metrics::MetricsSink`]
pub mod metrics {
    pub const TASKS_CREATED: &str = "tasks_created";
    pub const TASKS_COMPLETED: &str = "tasks_completed";
    pub const TASKS_FAILED: &str = "tasks_failed";
    pub const TASKS_CANCELLED: &str = "tasks_cancelled";
    pub const TASKS_ASSIGNED: &str = "tasks_assigned";
    pub const MESSAGES_SENT: &str = "messages_sent";
    pub const MESSAGES_RECEIVED: &str = "messages_received";
    pub const MESSAGES_REJECTED: &str = "messages_rejected";
    pub const MESSAGES_REPLAYED: &str = "messages_replayed";
}

/// Operational defaults used by [`crate::config::ConductorConfig::default`]
pub mod defaults {
    pub const CONDUCTOR_LOGICAL_ID: &str = "conductor";
    pub const BIND_ADDRESS: &str = "127.0.0.1:7420";
    pub const MAX_CONNECTIONS: usize = 256;
    pub const OUTBOUND_QUEUE_SIZE: usize = 1000;
    pub const SEND_TIMEOUT_MS: u64 = 5000;
    pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 2000;

    pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 45_000;

    pub const MAX_PERSISTED_MESSAGES: usize = 1000;
    pub const MAX_MESSAGES_PER_LOGICAL_ID: usize = 200;
    pub const HISTORY_RETENTION_LIMIT: usize = 100;

    pub const MAX_EVENT_CHANNELS: usize = 100;
    pub const MAX_SUBSCRIBERS_PER_CHANNEL: usize = 50;
    pub const HANDLER_TIMEOUT_MS: u64 = 30_000;
    pub const MAX_RECURSION_DEPTH: usize = 10;
    pub const DEBOUNCE_MS: u64 = 100;

    pub const MAX_TASK_RETRIES: u32 = 3;
    pub const SUBTASK_TIMEOUT_MS: u64 = 300_000;
    pub const MAX_TERMINAL_TASKS: usize = 10_000;
}
