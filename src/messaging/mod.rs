//! # Messaging Module
//!
//! Wire protocol, inbound validation, message persistence and routing between
//! logical endpoints. Frames are newline-delimited JSON objects; see
//! [`message`] for the envelope and payload shapes.

pub mod message;
pub mod persistence;
pub mod router;
pub mod validation;

pub use message::{
    AgentReadyPayload, AssignTaskPayload, ConnectionEstablishedPayload, EndpointRole,
    HeartbeatPayload, Message, MessagePayload, MessageType, SystemAckPayload,
    SystemErrorPayload, TaskCancelledPayload, TaskCompletePayload, TaskFailedPayload,
    TaskProgressPayload, TaskRefPayload,
};
pub use persistence::{
    HistoryFilter, InMemoryMessageStore, MessageStore, PersistenceError, PersistenceResult,
    StoreStats,
};
pub use router::{MessageRouter, RouteOutcome, DELIVERY_BREAKER};
pub use validation::{parse_message, validate_value, ValidationFailure, MAX_FRAME_BYTES};
