use async_trait::async_trait;
use batchflow_core::inference::{
    InferenceClient, InferenceError, InferenceOutput, InferenceRequest, PollStatus, TaskHandle,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the mock collaborator answers for one document
#[derive(Debug, Clone)]
pub enum Script {
    /// Terminal success once `after_polls` pending answers have been given
    Succeed { after_polls: u32, text: String },
    /// Terminal failure once `after_polls` pending answers have been given
    Fail { after_polls: u32, error: String },
    /// Poll calls error out `errors` times, then the task succeeds
    FlakyPoll { errors: u32 },
    /// `submit` itself fails
    RejectSubmit(String),
    /// `submit` takes this long before accepting; the task then succeeds
    SlowSubmit(Duration),
    /// The first `slow_polls` poll calls take `delay` each, then the task succeeds
    SlowPoll { slow_polls: u32, delay: Duration },
    /// Always pending
    NeverFinish,
}

impl Script {
    pub fn succeed() -> Self {
        Self::Succeed {
            after_polls: 0,
            text: "ok".to_string(),
        }
    }

    pub fn fail(error: &str) -> Self {
        Self::Fail {
            after_polls: 0,
            error: error.to_string(),
        }
    }
}

#[derive(Debug)]
struct RemoteTask {
    script: Script,
    polls: u32,
}

/// Scripted inference collaborator keyed by document id
///
/// Documents without a script succeed on their first poll.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInference {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    tasks: Arc<DashMap<String, RemoteTask>>,
    submissions: Arc<Mutex<Vec<InferenceRequest>>>,
    next_handle: Arc<AtomicU64>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, document_id: &str, script: Script) -> Self {
        self.scripts.lock().insert(document_id.to_string(), script);
        self
    }

    /// Every request the collaborator accepted or rejected, in order
    pub fn submissions(&self) -> Vec<InferenceRequest> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn poll_count(&self, handle: &str) -> u32 {
        self.tasks.get(handle).map(|task| task.polls).unwrap_or(0)
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn submit(&self, request: &InferenceRequest) -> Result<TaskHandle, InferenceError> {
        self.submissions.lock().push(request.clone());
        let script = self
            .scripts
            .lock()
            .get(&request.document_id)
            .cloned()
            .unwrap_or_else(Script::succeed);

        match &script {
            Script::RejectSubmit(reason) => return Err(InferenceError::Rejected(reason.clone())),
            Script::SlowSubmit(delay) => tokio::time::sleep(*delay).await,
            _ => {}
        }

        let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = format!("task-{n}");
        self.tasks
            .insert(handle.clone(), RemoteTask { script, polls: 0 });
        Ok(TaskHandle::new(handle))
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<PollStatus, InferenceError> {
        let (script, polls) = {
            let mut task = self
                .tasks
                .get_mut(handle.as_str())
                .ok_or_else(|| InferenceError::UnknownHandle(handle.to_string()))?;
            task.polls += 1;
            (task.script.clone(), task.polls)
        };

        match &script {
            Script::Succeed { after_polls, text } if polls > *after_polls => {
                Ok(PollStatus::Succeeded {
                    output: InferenceOutput {
                        text: Some(text.clone()),
                        input_tokens: Some(10),
                        output_tokens: Some(5),
                        raw: None,
                    },
                })
            }
            Script::Fail { after_polls, error } if polls > *after_polls => {
                Ok(PollStatus::Failed {
                    error: error.clone(),
                })
            }
            Script::FlakyPoll { errors } if polls <= *errors => Err(InferenceError::Unavailable(
                "connection reset".to_string(),
            )),
            Script::FlakyPoll { .. } | Script::SlowSubmit(_) => Ok(PollStatus::Succeeded {
                output: InferenceOutput::default(),
            }),
            Script::SlowPoll { slow_polls, delay } if polls <= *slow_polls => {
                tokio::time::sleep(*delay).await;
                Ok(PollStatus::Pending)
            }
            Script::SlowPoll { .. } => Ok(PollStatus::Succeeded {
                output: InferenceOutput::default(),
            }),
            _ => Ok(PollStatus::Pending),
        }
    }
}
