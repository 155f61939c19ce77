//! # Events
//!
//! In-process pub/sub for domain events and debouncing of high-frequency
//! status updates before they reach the bus.

pub mod bus;
pub mod debounce;

pub use bus::{
    handler_fn, Event, EventBus, EventBusError, EventBusResult, EventHandler, SubscriptionToken,
};
pub use debounce::Debouncer;
