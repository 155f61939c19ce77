//! # Execution
//!
//! Network side of the conductor: the TCP server, the connection pool that
//! binds sockets to logical endpoint ids, and the worker launcher seam.

pub mod connection_pool;
pub mod launcher;
pub mod server;

pub use connection_pool::{
    ConnectionId, ConnectionInfo, ConnectionPool, ConnectionPoolError, ConnectionPoolResult,
    ConnectionRegistration, DisconnectReason, PoolEvent, PoolSettings,
};
pub use launcher::{ExternalLauncher, WorkerHandle, WorkerLauncher};
pub use server::{OrchestrationServer, OrchestrationServerError, ServerStatus};
