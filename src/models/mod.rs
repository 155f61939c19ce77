//! Domain models shared by the scheduler, the router and the wire protocol.

pub mod task;

pub use task::{NewTask, Task, TaskId, TaskPriority};
