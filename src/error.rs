use crate::config::ConfigurationError;
use crate::database::StoreError;
use crate::inference::InferenceError;
use crate::staging::StagingError;
use crate::state_machine::StateMachineError;
use thiserror::Error;

/// Crate-level error aggregating every layer
///
/// Layer-specific errors convert with `?`, so orchestration code can return
/// a single type.
#[derive(Debug, Error)]
pub enum BatchflowError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State transition error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Batch not found: {0}")]
    BatchNotFound(uuid::Uuid),

    #[error("Orchestration error: {0}")]
    Orchestration(String),
}

pub type BatchflowResult<T> = std::result::Result<T, BatchflowError>;
