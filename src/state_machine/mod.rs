//! # Batch State Machine
//!
//! Batch and work item lifecycles, the transition table, guards, and the
//! [`StateMachineController`] that owns every status write.

pub mod actions;
pub mod controller;
pub mod errors;
pub mod events;
pub mod guards;
pub mod states;
pub mod transitions;

// Re-export main types for convenient access
pub use controller::{RejectionKind, StateMachineController, TransitionContext, TransitionResponse};
pub use errors::{ActionError, GuardError, StateMachineError, StateMachineResult};
pub use events::{BatchAction, WorkItemEvent};
pub use states::{BatchStatus, WorkItemStatus};
pub use transitions::{allowed_actions, target_status};

// Common traits
pub use actions::StateAction;
pub use guards::StateGuard;
