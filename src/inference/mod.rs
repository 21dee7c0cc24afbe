//! # Inference Collaborator Contract
//!
//! The engine consumes, but never implements, an external inference service.
//! Providers plug in behind [`InferenceClient`]; the dispatcher treats every
//! client identically and never branches on provider identity.
//!
//! The contract has two calls:
//!
//! - `submit(request) -> handle | error`
//! - `poll(handle) -> pending | succeeded(output) | failed(error)`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque task handle returned by the collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Payload handed to the collaborator for a single work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub work_item_id: Uuid,
    pub batch_id: Uuid,
    pub document_id: String,
    pub connection_id: String,
    pub prompt_id: String,
    pub payload: Value,
}

impl From<&crate::models::WorkItem> for InferenceRequest {
    fn from(item: &crate::models::WorkItem) -> Self {
        Self {
            work_item_id: item.work_item_id,
            batch_id: item.batch_id,
            document_id: item.document_id.clone(),
            connection_id: item.connection_id.clone(),
            prompt_id: item.prompt_id.clone(),
            payload: item.payload.clone(),
        }
    }
}

/// Successful inference output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub text: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub raw: Option<Value>,
}

impl InferenceOutput {
    /// Result record for a successful call that took `latency_ms`
    pub fn into_result(self, latency_ms: Option<u64>) -> crate::models::WorkItemResult {
        crate::models::WorkItemResult {
            text: self.text,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            latency_ms,
            error: None,
            raw: self.raw,
        }
    }
}

/// Answer to a poll
///
/// Maps the wire contract `{terminal, success, result?, error?}`: `Pending` is
/// non-terminal, the other two variants are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    Succeeded { output: InferenceOutput },
    Failed { error: String },
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Errors raised while talking to the collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("Submission rejected: {0}")]
    Rejected(String),
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown task handle: {0}")]
    UnknownHandle(String),
    #[error("Call timed out after {0}ms")]
    Timeout(u64),
}

/// External inference service consumed by the dispatcher
#[async_trait]
pub trait InferenceClient: Send + Sync + fmt::Debug {
    /// Submit one work item payload, returning the handle to poll
    async fn submit(&self, request: &InferenceRequest) -> Result<TaskHandle, InferenceError>;

    /// Check on a previously submitted task
    async fn poll(&self, handle: &TaskHandle) -> Result<PollStatus, InferenceError>;
}
