use super::errors::{ActionError, ActionResult};
use crate::constants::events;
use crate::events::EventPublisher;
use crate::logging::log_batch_operation;
use crate::metrics;
use crate::models::{Batch, BatchTransition};
use async_trait::async_trait;
use opentelemetry::KeyValue;

/// Side effect run after a transition has been committed
///
/// Actions observe; they never write to the store. A failing action is
/// logged by the controller and does not undo the transition.
#[async_trait]
pub trait StateAction: Send + Sync + std::fmt::Debug {
    async fn execute(&self, batch: &Batch, transition: &BatchTransition) -> ActionResult<()>;

    /// Get a description of this action for logging
    fn description(&self) -> &'static str;
}

/// Action to publish lifecycle events when transitions occur
#[derive(Debug, Clone)]
pub struct PublishTransitionEventAction {
    event_publisher: EventPublisher,
}

impl PublishTransitionEventAction {
    pub fn new(event_publisher: EventPublisher) -> Self {
        Self { event_publisher }
    }
}

#[async_trait]
impl StateAction for PublishTransitionEventAction {
    async fn execute(&self, _batch: &Batch, transition: &BatchTransition) -> ActionResult<()> {
        self.event_publisher
            .publish_transition(transition)
            .map_err(|_| ActionError::EventPublishFailed {
                event_name: events::BATCH_TRANSITIONED.to_string(),
            })
    }

    fn description(&self) -> &'static str {
        "Publish lifecycle event for batch transition"
    }
}

/// Action to count accepted transitions and log them uniformly
#[derive(Debug, Clone, Default)]
pub struct RecordTransitionAction;

#[async_trait]
impl StateAction for RecordTransitionAction {
    async fn execute(&self, batch: &Batch, transition: &BatchTransition) -> ActionResult<()> {
        metrics::transitions_accepted_total().add(
            1,
            &[
                KeyValue::new("action", transition.action.as_str()),
                KeyValue::new("to_status", transition.to_status.as_str()),
            ],
        );

        let details = format!(
            "{} -> {} by {}",
            transition.from_status, transition.to_status, transition.actor
        );
        log_batch_operation(
            transition.action.as_str(),
            batch.batch_id,
            transition.to_status.as_str(),
            Some(batch.version),
            Some(&details),
        );
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Record metrics and structured log for batch transition"
    }
}

/// Default post-transition actions
pub fn default_actions(event_publisher: EventPublisher) -> Vec<Box<dyn StateAction>> {
    vec![
        Box::new(RecordTransitionAction),
        Box::new(PublishTransitionEventAction::new(event_publisher)),
    ]
}
