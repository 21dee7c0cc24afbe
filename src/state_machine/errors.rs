use super::events::BatchAction;
use super::states::BatchStatus;
use crate::database::StoreError;
use crate::staging::StagingError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while applying batch transitions and work item outcomes
///
/// Rejections a caller can act on (illegal action, failed precondition,
/// version conflict) are reported through [`super::TransitionResponse`]
/// instead; this type carries infrastructure failures and lookups of
/// records that do not exist.
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("Work item not found: {0}")]
    WorkItemNotFound(Uuid),

    #[error("Invalid transition: {action} is not allowed from {from}")]
    InvalidTransition {
        from: BatchStatus,
        action: BatchAction,
    },

    #[error("Guard condition failed: {0}")]
    GuardFailed(#[from] GuardError),

    #[error("Version conflict on batch {batch_id}: expected {expected}, found {actual}")]
    VersionConflict {
        batch_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Precondition failures checked before a transition is attempted
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Batch has no queued or claimed work items")]
    NoQueuedItems,

    #[error("Batch has no in-flight work items")]
    NothingInFlight,

    #[error("Batch still has outstanding work items ({terminal} of {total} terminal)")]
    ItemsOutstanding { terminal: i64, total: i64 },

    #[error("No failed or timed out work items to requeue")]
    NothingToRequeue,

    #[error("Batch has no configuration snapshot to rerun")]
    MissingSnapshot,

    #[error("Guard query failed: {0}")]
    Store(#[from] StoreError),
}

/// Post-transition side effect failures
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Event publishing failed: {event_name}")]
    EventPublishFailed { event_name: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;
pub type ActionResult<T> = Result<T, ActionError>;

impl GuardError {
    /// Whether the guard failed because of the store rather than the batch's data
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_error_converts() {
        let err: StateMachineError = GuardError::NoQueuedItems.into();
        assert!(matches!(err, StateMachineError::GuardFailed(GuardError::NoQueuedItems)));
        assert_eq!(
            err.to_string(),
            "Guard condition failed: Batch has no queued or claimed work items"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = StateMachineError::InvalidTransition {
            from: BatchStatus::Created,
            action: BatchAction::Run,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: run is not allowed from CREATED"
        );
    }
}
