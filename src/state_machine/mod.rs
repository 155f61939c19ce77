// Task lifecycle state machine
//
// A pure guard over status mutation: legal transitions are enumerated in one
// table and every accepted change is recorded with a timestamp.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::TaskStatus;
pub use task_state_machine::{TaskStateMachine, TransitionRecord};
