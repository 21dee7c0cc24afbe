use crate::constants::events;
use crate::models::BatchTransition;
use crate::state_machine::{BatchStatus, WorkItemEvent, WorkItemStatus};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Fan-out publisher for batch lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
    enabled: bool,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            enabled: true,
        }
    }

    /// Publisher that drops every event
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(1)
        }
    }

    /// Publish an event with the given name and context
    pub fn publish(&self, event_name: impl Into<String>, context: Value) -> Result<(), PublishError> {
        if !self.enabled {
            return Ok(());
        }

        let event = PublishedEvent {
            name: event_name.into(),
            context,
            published_at: chrono::Utc::now(),
        };

        // A send error only means there are no subscribers right now
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Publish an accepted batch transition, plus the milestone event it implies
    pub fn publish_transition(&self, transition: &BatchTransition) -> Result<(), PublishError> {
        let context = serde_json::to_value(transition)?;
        self.publish(events::BATCH_TRANSITIONED, context.clone())?;

        let milestone = match (transition.from_status, transition.to_status) {
            (BatchStatus::Staging, BatchStatus::Staged) => Some(events::BATCH_STAGED),
            (_, BatchStatus::FailedStaging) => Some(events::BATCH_STAGING_FAILED),
            (_, BatchStatus::Completed) => Some(events::BATCH_COMPLETED),
            (BatchStatus::Processing | BatchStatus::Paused, BatchStatus::Failed) => {
                Some(events::BATCH_CANCELLED)
            }
            _ => None,
        };
        match milestone {
            Some(name) => self.publish(name, context),
            None => Ok(()),
        }
    }

    /// Publish an outcome recorded for a work item
    pub fn publish_work_item_event(
        &self,
        batch_id: Uuid,
        work_item_id: Uuid,
        event: &WorkItemEvent,
    ) -> Result<(), PublishError> {
        let name = match event.terminal_status() {
            None => events::WORK_ITEM_SUBMITTED,
            Some(WorkItemStatus::Completed) => events::WORK_ITEM_SUCCEEDED,
            Some(WorkItemStatus::Timeout) => events::WORK_ITEM_TIMED_OUT,
            Some(_) => events::WORK_ITEM_FAILED,
        };
        self.publish(
            name,
            json!({
                "batch_id": batch_id,
                "work_item_id": work_item_id,
                "event": event,
            }),
        )
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::constants::system::DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkItemResult;
    use crate::state_machine::BatchAction;
    use chrono::Utc;

    fn transition(from: BatchStatus, to: BatchStatus, action: BatchAction) -> BatchTransition {
        BatchTransition {
            batch_id: Uuid::new_v4(),
            from_status: from,
            to_status: to,
            action,
            actor: "test".to_string(),
            reason: None,
            version: 4,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(8);
        assert_eq!(publisher.subscriber_count(), 0);
        tokio_test::assert_ok!(publisher.publish("anything", json!({})));
    }

    #[tokio::test]
    async fn test_completion_publishes_milestone() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher
            .publish_transition(&transition(
                BatchStatus::Processing,
                BatchStatus::Completed,
                BatchAction::Complete,
            ))
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.name, events::BATCH_TRANSITIONED);
        assert_eq!(second.name, events::BATCH_COMPLETED);
        assert_eq!(second.context["to_status"], "COMPLETED");
        assert_eq!(second.context["version"], 4);
    }

    #[tokio::test]
    async fn test_work_item_event_names() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher
            .publish_work_item_event(
                Uuid::new_v4(),
                Uuid::new_v4(),
                &WorkItemEvent::Succeeded(WorkItemResult::default()),
            )
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name, events::WORK_ITEM_SUCCEEDED);
    }

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let publisher = EventPublisher::disabled();
        let mut rx = publisher.subscribe();
        tokio_test::assert_ok!(publisher.publish("dropped", json!({})));
        tokio_test::assert_err!(rx.try_recv());
    }
}
