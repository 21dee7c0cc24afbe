//! In-memory engine wired the same way `OrchestrationCore` wires it, with
//! every component exposed so tests can drive loops by hand.

use super::mock_inference::ScriptedInference;
use super::mock_resolver::StaticResolver;
use batchflow_core::config::OrchestratorConfig;
use batchflow_core::database::{BatchStore, ClaimRequest, InMemoryBatchStore};
use batchflow_core::events::EventPublisher;
use batchflow_core::models::{Batch, NewBatch, WorkItem, WorkItemResult};
use batchflow_core::orchestration::{
    ActiveTaskRegistry, ProgressAggregator, RecoveryManager, WorkDispatcher,
};
use batchflow_core::staging::ConfigurationResolver;
use batchflow_core::state_machine::{
    BatchAction, BatchStatus, StateMachineController, TransitionContext, TransitionResponse,
    WorkItemEvent,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Configuration with intervals short enough for real-time tests
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.dispatcher.worker_count = 2;
    config.dispatcher.max_in_flight = 8;
    config.dispatcher.submission_timeout_ms = 500;
    config.dispatcher.poll_interval_ms = 20;
    config.dispatcher.poll_request_timeout_ms = 500;
    config.dispatcher.item_timeout_seconds = 1;
    config.dispatcher.idle_backoff_ms = 10;
    config.dispatcher.sweep_interval_seconds = 1;
    config
}

pub struct TestEngine {
    pub store: Arc<InMemoryBatchStore>,
    pub controller: StateMachineController,
    pub aggregator: ProgressAggregator,
    pub registry: Arc<ActiveTaskRegistry>,
    pub dispatcher: WorkDispatcher,
    pub recovery: RecoveryManager,
    pub inference: ScriptedInference,
    pub events: EventPublisher,
    pub shutdown: watch::Sender<bool>,
}

impl TestEngine {
    pub fn new(resolver: Arc<dyn ConfigurationResolver>, inference: ScriptedInference) -> Self {
        Self::with_config(resolver, inference, fast_config())
    }

    /// Engine whose resolver stages one item per document
    pub fn with_documents(documents: &[&str], inference: ScriptedInference) -> Self {
        Self::new(Arc::new(StaticResolver::documents(documents)), inference)
    }

    pub fn with_config(
        resolver: Arc<dyn ConfigurationResolver>,
        inference: ScriptedInference,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_store(resolver, inference, config, |store| store as Arc<dyn BatchStore>)
    }

    /// Engine whose components see `wrap(store)`; `self.store` stays the raw backing store
    pub fn with_store(
        resolver: Arc<dyn ConfigurationResolver>,
        inference: ScriptedInference,
        config: OrchestratorConfig,
        wrap: impl FnOnce(Arc<InMemoryBatchStore>) -> Arc<dyn BatchStore>,
    ) -> Self {
        config.validate().expect("test configuration must be valid");

        let store = Arc::new(InMemoryBatchStore::new());
        let events = EventPublisher::new(config.events.channel_capacity);
        let controller = StateMachineController::new(
            wrap(store.clone()),
            resolver,
            events.clone(),
            config.state_machine.clone(),
        );
        let aggregator = ProgressAggregator::new(controller.clone());
        let registry = Arc::new(ActiveTaskRegistry::new(config.dispatcher.max_in_flight));
        let (shutdown, shutdown_receiver) = watch::channel(false);
        let dispatcher = WorkDispatcher::new(
            controller.clone(),
            Arc::new(inference.clone()),
            aggregator.clone(),
            registry.clone(),
            config.dispatcher.clone(),
            shutdown_receiver,
        );
        let recovery = RecoveryManager::new(
            controller.clone(),
            aggregator.clone(),
            registry.clone(),
            config.recovery.clone(),
        );

        Self {
            store,
            controller,
            aggregator,
            registry,
            dispatcher,
            recovery,
            inference,
            events,
            shutdown,
        }
    }

    pub async fn create_batch(&self, name: &str) -> Batch {
        self.controller
            .create_batch(NewBatch::new(name))
            .await
            .expect("batch creation should succeed")
    }

    pub async fn request(&self, batch_id: Uuid, action: BatchAction) -> TransitionResponse {
        self.controller
            .request_state_change(batch_id, action, TransitionContext::new())
            .await
            .expect("transition request should not error")
    }

    /// CREATED -> SAVED -> STAGED
    pub async fn staged_batch(&self, name: &str) -> Batch {
        let batch = self.create_batch(name).await;
        for action in [BatchAction::Save, BatchAction::Stage] {
            let response = self.request(batch.batch_id, action).await;
            assert!(response.accepted, "{action} rejected: {:?}", response.reason);
        }
        self.batch(batch.batch_id).await
    }

    /// CREATED -> SAVED -> STAGED -> PROCESSING
    pub async fn running_batch(&self, name: &str) -> Batch {
        let batch = self.staged_batch(name).await;
        let response = self.request(batch.batch_id, BatchAction::Run).await;
        assert!(response.accepted, "run rejected: {:?}", response.reason);
        self.batch(batch.batch_id).await
    }

    pub async fn batch(&self, batch_id: Uuid) -> Batch {
        self.store
            .find_batch(batch_id)
            .await
            .expect("store read should succeed")
            .expect("batch should exist")
    }

    /// Claim every queued item directly and report `outcome` for each
    ///
    /// Bypasses the collaborator; returns the number of items finished.
    pub async fn finish_all(&self, batch_id: Uuid, outcome: impl Fn(usize) -> WorkItemEvent) -> usize {
        let mut finished = 0;
        while let Some(item) = self.claim_at(Utc::now()).await {
            assert_eq!(item.batch_id, batch_id, "claimed an item of another batch");
            let applied = self
                .controller
                .report_work_item(item.work_item_id, outcome(finished))
                .await
                .expect("report should succeed");
            assert!(applied);
            finished += 1;
        }
        finished
    }

    /// Claim one queued item straight from the store, as a crashed process would have
    pub async fn claim_at(&self, claimed_at: DateTime<Utc>) -> Option<WorkItem> {
        self.store
            .claim_next_work_item(ClaimRequest {
                batch_statuses: BatchStatus::CLAIMABLE.to_vec(),
                per_batch_limit: None,
                claimed_at,
            })
            .await
            .expect("claim should succeed")
    }

    /// Run a batch to COMPLETED with every item succeeding
    pub async fn completed_batch(&self, name: &str) -> Batch {
        let batch = self.running_batch(name).await;
        self.finish_all(batch.batch_id, |_| {
            WorkItemEvent::Succeeded(WorkItemResult::default())
        })
        .await;
        let snapshot = self
            .aggregator
            .recompute(batch.batch_id)
            .await
            .expect("recompute should succeed");
        assert!(snapshot.completed);
        self.batch(batch.batch_id).await
    }

    /// Claim and submit one item through the dispatcher if a slot is free
    pub async fn dispatch_one(&self) -> Option<Uuid> {
        let permit = self.registry.try_acquire_slot()?;
        self.dispatcher
            .dispatch_next(permit)
            .await
            .expect("dispatch should not error")
    }

    /// Poll until the batch reaches `status` or `within` elapses
    pub async fn wait_for_status(&self, batch_id: Uuid, status: BatchStatus, within: Duration) -> Batch {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let batch = self.batch(batch_id).await;
            if batch.status == status {
                return batch;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "batch {batch_id} still {} after {within:?}, expected {status}",
                batch.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the active task registry drains
    pub async fn wait_for_idle(&self, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        while !self.registry.is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} tasks still active after {within:?}",
                self.registry.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
