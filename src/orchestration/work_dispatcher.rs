//! # Work Dispatcher
//!
//! N claim-and-submit workers plus one tracker task per active work item.
//!
//! ## Claim Protocol
//!
//! A worker first waits for a slot of the global in-flight semaphore, then
//! asks the store to atomically claim one QUEUED item of a STAGED or
//! PROCESSING batch (lock-and-skip, so two workers never get the same row).
//! The per-batch ceiling is checked by the store inside that same claim.
//! The claimed item is registered as active *before* the submission call so
//! periodic recovery never mistakes an in-flight submission for an orphan.
//! The first claim from a STAGED batch moves that batch to PROCESSING; the
//! sweep promotes any STAGED batch the workers have not reached yet.
//!
//! ## Tracking
//!
//! Each submitted item gets its own tracker task that polls on
//! `poll_interval`, independent of every other item. A terminal answer or the
//! item timeout ends the tracker: the outcome goes through the controller,
//! the active record (and its slot) is dropped, and the aggregator
//! recomputes the batch.
//!
//! Pause and cancel only stop new claims; trackers of in-flight items keep
//! running and their outcomes are still recorded.

use super::active_tasks::{ActiveTaskRecord, ActiveTaskRegistry};
use super::progress_aggregator::ProgressAggregator;
use crate::config::DispatcherConfig;
use crate::constants::actors;
use crate::database::ClaimRequest;
use crate::error::BatchflowResult;
use crate::inference::{InferenceClient, InferenceRequest, PollStatus, TaskHandle};
use crate::logging::log_work_item_operation;
use crate::metrics;
use crate::models::{ErrorDetail, ErrorKind, WorkItem, WorkItemResult};
use crate::state_machine::{
    BatchAction, BatchStatus, StateMachineController, TransitionContext, WorkItemEvent,
};
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkDispatcher {
    controller: StateMachineController,
    inference: Arc<dyn InferenceClient>,
    aggregator: ProgressAggregator,
    registry: Arc<ActiveTaskRegistry>,
    config: DispatcherConfig,
    shutdown: watch::Receiver<bool>,
}

impl WorkDispatcher {
    pub fn new(
        controller: StateMachineController,
        inference: Arc<dyn InferenceClient>,
        aggregator: ProgressAggregator,
        registry: Arc<ActiveTaskRegistry>,
        config: DispatcherConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            controller,
            inference,
            aggregator,
            registry,
            config,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ActiveTaskRegistry> {
        &self.registry
    }

    /// Spawn the configured number of claim-and-submit workers
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.config.worker_count,
            max_in_flight = self.config.max_in_flight,
            max_in_flight_per_batch = ?self.config.max_in_flight_per_batch,
            "🚀 Starting dispatcher workers"
        );

        (0..self.config.worker_count)
            .map(|worker_id| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.run_worker(worker_id).await })
            })
            .collect()
    }

    /// Spawn the discovery sweep (STAGED promotion and progress sweep)
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run_sweeper().await })
    }

    async fn run_worker(self, worker_id: usize) {
        let mut shutdown = self.shutdown.clone();
        debug!(worker_id, "Dispatcher worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.registry.acquire_slot() => permit,
                _ = shutdown.changed() => break,
            };
            let Some(permit) = permit else {
                break;
            };

            let idle = match self.dispatch_next(permit).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker_id, error = %e, "Dispatch cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = sleep(self.config.idle_backoff()) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        debug!(worker_id, "Dispatcher worker stopped");
    }

    /// Claim one queued item with an already-acquired slot and submit it
    ///
    /// Returns the claimed item id, or `None` (releasing the slot) when nothing
    /// is claimable right now.
    pub async fn dispatch_next(
        &self,
        permit: OwnedSemaphorePermit,
    ) -> BatchflowResult<Option<Uuid>> {
        let Some(item) = self.claim_next().await? else {
            return Ok(None);
        };

        let work_item_id = item.work_item_id;
        self.registry.register(
            ActiveTaskRecord::claimed(work_item_id, item.batch_id, Utc::now()),
            permit,
        );
        metrics::work_items_claimed_total().add(1, &[]);
        log_work_item_operation(
            "claimed",
            item.batch_id,
            work_item_id,
            item.status.as_str(),
            None,
        );

        if let Err(e) = self.promote_claimed_batch(item.batch_id).await {
            warn!(batch_id = %item.batch_id, error = %e, "Could not promote batch on first claim");
        }

        self.submit(&item).await;
        Ok(Some(work_item_id))
    }

    async fn claim_next(&self) -> BatchflowResult<Option<WorkItem>> {
        let request = ClaimRequest {
            batch_statuses: BatchStatus::CLAIMABLE.to_vec(),
            per_batch_limit: self.config.max_in_flight_per_batch,
            claimed_at: Utc::now(),
        };
        Ok(self.controller.store().claim_next_work_item(request).await?)
    }

    /// Run a STAGED batch once one of its items has been claimed
    async fn promote_claimed_batch(&self, batch_id: Uuid) -> BatchflowResult<()> {
        let staged = self
            .controller
            .store()
            .find_batch(batch_id)
            .await?
            .is_some_and(|batch| batch.status == BatchStatus::Staged);
        if !staged {
            return Ok(());
        }

        let response = self
            .controller
            .request_with_retry(
                batch_id,
                BatchAction::Run,
                TransitionContext::system(actors::DISPATCHER).with_reason("first work item claimed"),
            )
            .await?;
        if !response.accepted {
            debug!(batch_id = %batch_id, reason = ?response.reason, "Claimed batch not promoted");
        }
        Ok(())
    }

    async fn submit(&self, item: &WorkItem) {
        let request = InferenceRequest::from(item);
        let started = Instant::now();
        let submission = timeout(self.config.submission_timeout(), self.inference.submit(&request)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (outcome, error) = match submission {
            Ok(Ok(handle)) => ("submitted", Ok(handle)),
            Ok(Err(e)) => ("rejected", Err(e.to_string())),
            Err(_) => (
                "timeout",
                Err(format!(
                    "submission timed out after {}ms",
                    self.config.submission_timeout_ms
                )),
            ),
        };
        metrics::submission_duration()
            .record(latency_ms as f64, &[KeyValue::new("outcome", outcome)]);

        match error {
            Ok(handle) => self.record_submission(item, handle).await,
            Err(message) => {
                warn!(
                    work_item_id = %item.work_item_id,
                    batch_id = %item.batch_id,
                    error = %message,
                    "Submission failed"
                );
                let result = WorkItemResult::failure(
                    ErrorDetail::new(ErrorKind::Submission, message),
                    Some(latency_ms),
                );
                self.finish(item.work_item_id, item.batch_id, WorkItemEvent::Failed(result), None)
                    .await;
            }
        }
    }

    async fn record_submission(&self, item: &WorkItem, handle: TaskHandle) {
        match self
            .controller
            .report_work_item(item.work_item_id, WorkItemEvent::Submitted(handle.clone()))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    work_item_id = %item.work_item_id,
                    handle = %handle,
                    "Work item left PROCESSING during submission, not tracking"
                );
                self.registry.remove(item.work_item_id);
                return;
            }
            Err(e) => {
                // The remote task is running either way; track it with the in-memory handle
                error!(
                    work_item_id = %item.work_item_id,
                    handle = %handle,
                    error = %e,
                    "Failed to persist task handle, tracking from memory"
                );
            }
        }

        self.registry
            .mark_submitted(item.work_item_id, handle.clone(), Utc::now());
        self.spawn_tracker(item.work_item_id, item.batch_id, handle);
    }

    fn spawn_tracker(&self, work_item_id: Uuid, batch_id: Uuid, handle: TaskHandle) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.track(work_item_id, batch_id, handle).await })
    }

    /// Poll one task until it is terminal or the item timeout elapses
    async fn track(self, work_item_id: Uuid, batch_id: Uuid, handle: TaskHandle) {
        let mut shutdown = self.shutdown.clone();
        let submitted = Instant::now();
        let deadline = submitted + self.config.item_timeout();

        loop {
            tokio::select! {
                _ = sleep(self.config.poll_interval()) => {}
                _ = shutdown.changed() => {
                    debug!(work_item_id = %work_item_id, "Tracker stopped by shutdown");
                    return;
                }
            }

            let latency_ms = Some(submitted.elapsed().as_millis() as u64);
            let event = match timeout(self.config.poll_request_timeout(), self.inference.poll(&handle)).await {
                Ok(Ok(PollStatus::Pending)) => None,
                Ok(Ok(PollStatus::Succeeded { output })) => {
                    Some(WorkItemEvent::Succeeded(output.into_result(latency_ms)))
                }
                Ok(Ok(PollStatus::Failed { error })) => Some(WorkItemEvent::Failed(
                    WorkItemResult::failure(ErrorDetail::new(ErrorKind::Inference, error), latency_ms),
                )),
                Ok(Err(e)) => {
                    warn!(work_item_id = %work_item_id, handle = %handle, error = %e, "Poll failed, will retry");
                    None
                }
                Err(_) => {
                    warn!(work_item_id = %work_item_id, handle = %handle, "Poll call timed out, will retry");
                    None
                }
            };

            let event = event.or_else(|| {
                (Instant::now() >= deadline).then(|| {
                    WorkItemEvent::TimedOut(ErrorDetail::new(
                        ErrorKind::Timeout,
                        format!(
                            "no terminal answer after {}s",
                            self.config.item_timeout_seconds
                        ),
                    ))
                })
            });

            if let Some(event) = event {
                self.finish(work_item_id, batch_id, event, Some(submitted.elapsed()))
                    .await;
                return;
            }
        }
    }

    /// Record a terminal outcome, free the slot and recompute the batch
    async fn finish(
        &self,
        work_item_id: Uuid,
        batch_id: Uuid,
        event: WorkItemEvent,
        turnaround: Option<Duration>,
    ) {
        let status = event.terminal_status();
        if let Err(e) = self.controller.report_work_item(work_item_id, event).await {
            error!(work_item_id = %work_item_id, error = %e, "Failed to record work item outcome");
        }
        self.registry.remove(work_item_id);

        if let (Some(status), Some(turnaround)) = (status, turnaround) {
            metrics::work_item_turnaround().record(
                turnaround.as_millis() as f64,
                &[KeyValue::new("status", status.as_str())],
            );
        }

        if let Err(e) = self.aggregator.recompute(batch_id).await {
            error!(batch_id = %batch_id, error = %e, "Progress recompute failed");
        }
    }

    async fn run_sweeper(self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.sweep_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.promote_staged().await {
                error!(error = %e, "Staged batch promotion failed");
            }
            if let Err(e) = self.aggregator.sweep().await {
                error!(error = %e, "Progress sweep failed");
            }
        }
        debug!("Dispatcher sweeper stopped");
    }

    /// Move STAGED batches with queued items to PROCESSING
    pub async fn promote_staged(&self) -> BatchflowResult<Vec<Uuid>> {
        let staged = self
            .controller
            .store()
            .list_batches(&[BatchStatus::Staged])
            .await?;

        let mut promoted = Vec::new();
        for batch in staged {
            let response = self
                .controller
                .request_with_retry(
                    batch.batch_id,
                    BatchAction::Run,
                    TransitionContext::system(actors::DISPATCHER),
                )
                .await?;
            if response.accepted {
                promoted.push(batch.batch_id);
            } else {
                debug!(batch_id = %batch.batch_id, reason = ?response.reason, "Staged batch not promoted");
            }
        }

        if !promoted.is_empty() {
            info!(count = promoted.len(), "Promoted staged batches to PROCESSING");
        }
        Ok(promoted)
    }
}
