//! # State Machine Controller
//!
//! The single write path into batch status and work item outcomes.
//!
//! Every batch transition is a compare-and-set on `(batch_id, version)`:
//! read the batch, check the action against the transition table and its
//! guard, then write the new status with `version + 1`. A concurrent writer
//! that got there first makes the write miss, and the caller gets a rejected
//! [`TransitionResponse`] carrying the current status.
//!
//! External callers and the engine's own loops (dispatcher, aggregator,
//! recovery) go through the same methods; engine loops use
//! [`StateMachineController::request_with_retry`] to absorb version races.

use super::actions::{default_actions, StateAction};
use super::errors::{GuardError, StateMachineError, StateMachineResult};
use super::events::{BatchAction, WorkItemEvent};
use super::guards::guard_for;
use super::states::{BatchStatus, WorkItemStatus};
use super::transitions::{allowed_actions, target_status};
use crate::config::StateMachineConfig;
use crate::constants::{actors, events};
use crate::database::{
    BatchStore, CasOutcome, OrphanedItem, RequeueSelection, StagedItems, StatusUpdate,
};
use crate::events::EventPublisher;
use crate::logging::log_work_item_operation;
use crate::metrics;
use crate::models::{Batch, ConfigurationSnapshot, NewBatch, NewWorkItem, WorkItemResult};
use crate::staging::{ConfigurationResolver, StagingPlan, StagingResult};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Caller-supplied context of a transition request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionContext {
    /// Recorded in the transition log; defaults to the configured actor
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Version the caller observed; the request is rejected if it moved on
    #[serde(default)]
    pub expected_version: Option<i64>,
    /// Restricts `requeue` to these items
    #[serde(default)]
    pub work_item_ids: Option<Vec<Uuid>>,
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for an engine-initiated request
    pub fn system(actor: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_work_items(mut self, work_item_ids: Vec<Uuid>) -> Self {
        self.work_item_ids = Some(work_item_ids);
        self
    }
}

/// Why a transition request was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The action is not legal from the current status
    InvalidTransition,
    /// The action is legal but its precondition does not hold
    GuardFailed,
    /// Another writer moved the batch version first
    VersionConflict,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTransition => "invalid_transition",
            Self::GuardFailed => "guard_failed",
            Self::VersionConflict => "version_conflict",
        }
    }
}

/// Answer to a transition request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionResponse {
    pub batch_id: Uuid,
    pub accepted: bool,
    /// Status after the request: the new status, or the current one if rejected
    pub status: BatchStatus,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
    pub allowed_actions: Vec<BatchAction>,
}

impl TransitionResponse {
    fn accepted(batch: &Batch, reason: Option<String>) -> Self {
        Self {
            batch_id: batch.batch_id,
            accepted: true,
            status: batch.status,
            version: batch.version,
            reason,
            rejection: None,
            allowed_actions: allowed_actions(batch.status),
        }
    }

    fn rejected(batch: &Batch, rejection: RejectionKind, reason: String) -> Self {
        Self {
            batch_id: batch.batch_id,
            accepted: false,
            status: batch.status,
            version: batch.version,
            reason: Some(reason),
            rejection: Some(rejection),
            allowed_actions: allowed_actions(batch.status),
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        self.rejection == Some(RejectionKind::VersionConflict)
    }
}

/// Sole authority over batch status and work item outcomes
#[derive(Debug, Clone)]
pub struct StateMachineController {
    store: Arc<dyn BatchStore>,
    resolver: Arc<dyn ConfigurationResolver>,
    events: EventPublisher,
    actions: Arc<Vec<Box<dyn StateAction>>>,
    config: StateMachineConfig,
}

impl StateMachineController {
    pub fn new(
        store: Arc<dyn BatchStore>,
        resolver: Arc<dyn ConfigurationResolver>,
        events: EventPublisher,
        config: StateMachineConfig,
    ) -> Self {
        let actions = Arc::new(default_actions(events.clone()));
        Self {
            store,
            resolver,
            events,
            actions,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Insert a new batch in CREATED
    pub async fn create_batch(&self, batch: NewBatch) -> StateMachineResult<Batch> {
        let batch = self.store.insert_batch(batch, Utc::now()).await?;
        info!(batch_id = %batch.batch_id, sequence = batch.sequence_number, name = %batch.name, "Batch created");
        if let Err(e) = self.events.publish(
            events::BATCH_CREATED,
            json!({"batch_id": batch.batch_id, "name": batch.name}),
        ) {
            warn!(batch_id = %batch.batch_id, error = %e, "Failed to publish batch creation");
        }
        Ok(batch)
    }

    /// Validate and apply a batch action
    ///
    /// Returns `Err` only for missing batches and infrastructure failures;
    /// everything a caller can react to comes back as a rejected response.
    #[instrument(skip(self, context), fields(batch_id = %batch_id, action = %action))]
    pub async fn request_state_change(
        &self,
        batch_id: Uuid,
        action: BatchAction,
        context: TransitionContext,
    ) -> StateMachineResult<TransitionResponse> {
        let batch = self.load_batch(batch_id).await?;

        if let Some(expected) = context.expected_version {
            if expected != batch.version {
                let err = StateMachineError::VersionConflict {
                    batch_id,
                    expected,
                    actual: batch.version,
                };
                return Ok(self.reject(&batch, action, RejectionKind::VersionConflict, err.to_string()));
            }
        }

        let Some(target) = target_status(batch.status, action) else {
            let err = StateMachineError::InvalidTransition {
                from: batch.status,
                action,
            };
            return Ok(self.reject(&batch, action, RejectionKind::InvalidTransition, err.to_string()));
        };

        if let Some(guard) = guard_for(action, context.work_item_ids.as_deref()) {
            match guard.check(&batch, self.store.as_ref()).await {
                Ok(()) => {}
                Err(GuardError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    debug!(guard = guard.description(), "Guard rejected transition");
                    return Ok(self.reject(&batch, action, RejectionKind::GuardFailed, e.to_string()));
                }
            }
        }

        match action {
            BatchAction::Stage | BatchAction::Restage => self.run_staging(batch, action, &context).await,
            BatchAction::Rerun => self.rerun(batch, &context).await,
            BatchAction::Requeue => self.requeue(batch, target, &context).await,
            _ => {
                let update = self.status_update(&batch, action, target, &context, Utc::now());
                let outcome = self.store.compare_and_set_status(update.clone()).await?;
                self.finish_cas(outcome, &update, &batch, context.reason.clone()).await
            }
        }
    }

    /// [`Self::request_state_change`] retried on version conflicts
    ///
    /// Used by the engine's own loops, which never pin a version.
    pub async fn request_with_retry(
        &self,
        batch_id: Uuid,
        action: BatchAction,
        context: TransitionContext,
    ) -> StateMachineResult<TransitionResponse> {
        let mut attempt = 0;
        loop {
            let response = self
                .request_state_change(batch_id, action, context.clone())
                .await?;
            if !response.is_version_conflict() || attempt >= self.config.max_cas_retries {
                return Ok(response);
            }
            attempt += 1;
            debug!(batch_id = %batch_id, action = %action, attempt, "Retrying transition after version conflict");
        }
    }

    /// Record a dispatcher outcome for a processing work item
    ///
    /// Returns `false` when the item is no longer PROCESSING (reset by
    /// recovery, requeued, or already finished) and the outcome was dropped.
    #[instrument(skip(self, event), fields(work_item_id = %work_item_id, event = event.event_type()))]
    pub async fn report_work_item(
        &self,
        work_item_id: Uuid,
        event: WorkItemEvent,
    ) -> StateMachineResult<bool> {
        let now = Utc::now();
        let applied = match &event {
            WorkItemEvent::Submitted(handle) => {
                self.store
                    .record_submission(work_item_id, handle.as_str())
                    .await?
            }
            WorkItemEvent::Succeeded(result) => {
                self.store
                    .finish_work_item(work_item_id, WorkItemStatus::Completed, result, now)
                    .await?
            }
            WorkItemEvent::Failed(result) => {
                self.store
                    .finish_work_item(work_item_id, WorkItemStatus::Failed, result, now)
                    .await?
            }
            WorkItemEvent::TimedOut(detail) => {
                let result = WorkItemResult::failure(detail.clone(), None);
                self.store
                    .finish_work_item(work_item_id, WorkItemStatus::Timeout, &result, now)
                    .await?
            }
        };

        if !applied {
            debug!("Work item no longer processing, outcome dropped");
            return Ok(false);
        }

        let item = self
            .store
            .find_work_item(work_item_id)
            .await?
            .ok_or(StateMachineError::WorkItemNotFound(work_item_id))?;

        if let Some(status) = event.terminal_status() {
            metrics::work_items_finished_total()
                .add(1, &[KeyValue::new("status", status.as_str())]);
        }
        log_work_item_operation(
            event.event_type(),
            item.batch_id,
            work_item_id,
            item.status.as_str(),
            None,
        );
        if let Err(e) = self
            .events
            .publish_work_item_event(item.batch_id, work_item_id, &event)
        {
            warn!(error = %e, "Failed to publish work item event");
        }
        Ok(true)
    }

    /// Put PROCESSING items claimed at or before `cutoff` back in the queue
    ///
    /// Reserved for the recovery manager.
    pub async fn reset_orphaned_work_items(
        &self,
        cutoff: DateTime<Utc>,
        active: &[Uuid],
    ) -> StateMachineResult<Vec<OrphanedItem>> {
        let reset = self
            .store
            .reset_orphaned_work_items(cutoff, active, Utc::now())
            .await?;
        if !reset.is_empty() {
            metrics::work_items_recovered_total().add(reset.len() as u64, &[]);
            for item in &reset {
                log_work_item_operation(
                    "reset_orphaned",
                    item.batch_id,
                    item.work_item_id,
                    WorkItemStatus::Queued.as_str(),
                    None,
                );
            }
        }
        Ok(reset)
    }

    async fn load_batch(&self, batch_id: Uuid) -> StateMachineResult<Batch> {
        self.store
            .find_batch(batch_id)
            .await?
            .ok_or(StateMachineError::BatchNotFound(batch_id))
    }

    fn reject(
        &self,
        batch: &Batch,
        action: BatchAction,
        rejection: RejectionKind,
        reason: String,
    ) -> TransitionResponse {
        metrics::transitions_rejected_total().add(
            1,
            &[
                KeyValue::new("action", action.as_str()),
                KeyValue::new("reason", rejection.as_str()),
            ],
        );
        debug!(batch_id = %batch.batch_id, status = %batch.status, reason = %reason, "Transition rejected");
        TransitionResponse::rejected(batch, rejection, reason)
    }

    fn status_update(
        &self,
        batch: &Batch,
        action: BatchAction,
        to_status: BatchStatus,
        context: &TransitionContext,
        now: DateTime<Utc>,
    ) -> StatusUpdate {
        let (started_at, completed_at) = match to_status {
            BatchStatus::Processing => (batch.started_at.or(Some(now)), None),
            BatchStatus::Completed | BatchStatus::Failed => (batch.started_at, Some(now)),
            BatchStatus::Staging | BatchStatus::Staged => (None, None),
            _ => (batch.started_at, batch.completed_at),
        };

        StatusUpdate {
            batch_id: batch.batch_id,
            expected_version: batch.version,
            from_status: batch.status,
            to_status,
            action,
            actor: context
                .actor
                .clone()
                .unwrap_or_else(|| self.config.default_actor.clone()),
            reason: context.reason.clone(),
            started_at,
            completed_at,
            updated_at: now,
        }
    }

    /// Turn a compare-and-set outcome into a response, running actions on success
    async fn finish_cas(
        &self,
        outcome: CasOutcome,
        update: &StatusUpdate,
        read: &Batch,
        reason: Option<String>,
    ) -> StateMachineResult<TransitionResponse> {
        match outcome {
            CasOutcome::Applied(batch) => {
                self.run_actions(&batch, update).await;
                Ok(TransitionResponse::accepted(&batch, reason))
            }
            CasOutcome::Conflict(current) => {
                let err = StateMachineError::VersionConflict {
                    batch_id: read.batch_id,
                    expected: update.expected_version,
                    actual: current.version,
                };
                Ok(self.reject(&current, update.action, RejectionKind::VersionConflict, err.to_string()))
            }
            CasOutcome::NotFound => Err(StateMachineError::BatchNotFound(read.batch_id)),
        }
    }

    async fn run_actions(&self, batch: &Batch, update: &StatusUpdate) {
        let transition = update.transition_record();
        for action in self.actions.iter() {
            if let Err(e) = action.execute(batch, &transition).await {
                warn!(
                    batch_id = %batch.batch_id,
                    action = action.description(),
                    error = %e,
                    "Post-transition action failed"
                );
            }
        }
    }

    /// SAVED/COMPLETED/FAILED -> STAGING -> STAGED, or FAILED_STAGING
    async fn run_staging(
        &self,
        batch: Batch,
        action: BatchAction,
        context: &TransitionContext,
    ) -> StateMachineResult<TransitionResponse> {
        let update = self.status_update(&batch, action, BatchStatus::Staging, context, Utc::now());
        let outcome = self.store.compare_and_set_status(update.clone()).await?;
        let staging = match outcome {
            CasOutcome::Applied(staging) => {
                self.run_actions(&staging, &update).await;
                staging
            }
            other => return self.finish_cas(other, &update, &batch, None).await,
        };

        let now = Utc::now();
        let prepared = self.prepare_staging(&staging, now).await;
        let (snapshot, items) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.fail_staging(&staging, e.to_string()).await,
        };

        let item_count = items.len();
        let update = self.status_update(&staging, action, BatchStatus::Staged, context, now);
        let staged = StagedItems {
            snapshot: Some(snapshot),
            items,
            queued_at: now,
        };

        match self.store.replace_work_items(update.clone(), staged).await {
            Ok(outcome) => {
                if outcome.is_applied() {
                    info!(batch_id = %batch.batch_id, items = item_count, "Batch staged");
                }
                self.finish_cas(outcome, &update, &staging, context.reason.clone())
                    .await
            }
            Err(e) => {
                error!(batch_id = %batch.batch_id, error = %e, "Failed to persist staged work items");
                if let Err(fail_err) = self.fail_staging(&staging, e.to_string()).await {
                    warn!(batch_id = %batch.batch_id, error = %fail_err, "Could not mark batch FAILED_STAGING");
                }
                Err(e.into())
            }
        }
    }

    async fn prepare_staging(
        &self,
        batch: &Batch,
        staged_at: DateTime<Utc>,
    ) -> StagingResult<(ConfigurationSnapshot, Vec<NewWorkItem>)> {
        let plan = self.resolver.resolve(batch).await?;
        plan.ensure_not_empty()?;
        let snapshot = plan.to_snapshot(staged_at)?;
        Ok((snapshot, plan.build_work_items()))
    }

    /// STAGING -> FAILED_STAGING; the original request still counts as accepted
    async fn fail_staging(
        &self,
        staging: &Batch,
        reason: String,
    ) -> StateMachineResult<TransitionResponse> {
        warn!(batch_id = %staging.batch_id, reason = %reason, "Staging failed");
        let context = TransitionContext::system(actors::STAGING).with_reason(reason.clone());
        let update = self.status_update(
            staging,
            BatchAction::FailStaging,
            BatchStatus::FailedStaging,
            &context,
            Utc::now(),
        );
        let outcome = self.store.compare_and_set_status(update.clone()).await?;
        self.finish_cas(outcome, &update, staging, Some(reason)).await
    }

    /// COMPLETED/FAILED -> STAGED with items rebuilt from the existing snapshot
    async fn rerun(
        &self,
        batch: Batch,
        context: &TransitionContext,
    ) -> StateMachineResult<TransitionResponse> {
        let plan = batch
            .configuration_snapshot
            .as_ref()
            .ok_or(GuardError::MissingSnapshot)
            .map_err(StateMachineError::from)
            .and_then(|snapshot| StagingPlan::from_snapshot(snapshot).map_err(Into::into));
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                return Ok(self.reject(&batch, BatchAction::Rerun, RejectionKind::GuardFailed, e.to_string()))
            }
        };

        let now = Utc::now();
        let update = self.status_update(&batch, BatchAction::Rerun, BatchStatus::Staged, context, now);
        let staged = StagedItems {
            snapshot: None,
            items: plan.build_work_items(),
            queued_at: now,
        };
        let outcome = self.store.replace_work_items(update.clone(), staged).await?;
        self.finish_cas(outcome, &update, &batch, context.reason.clone())
            .await
    }

    /// Reset FAILED/TIMEOUT items to QUEUED under a version bump
    async fn requeue(
        &self,
        batch: Batch,
        target: BatchStatus,
        context: &TransitionContext,
    ) -> StateMachineResult<TransitionResponse> {
        let now = Utc::now();
        let update = self.status_update(&batch, BatchAction::Requeue, target, context, now);
        let selection = RequeueSelection {
            statuses: WorkItemStatus::REQUEUEABLE.to_vec(),
            work_item_ids: context.work_item_ids.clone(),
            queued_at: now,
        };

        let outcome = self.store.requeue_work_items(update.clone(), selection).await?;
        let requeued = outcome.requeued;
        if outcome.cas.is_applied() {
            info!(batch_id = %batch.batch_id, requeued, "Work items requeued");
            if let Err(e) = self.events.publish(
                events::WORK_ITEMS_REQUEUED,
                json!({"batch_id": batch.batch_id, "requeued": requeued}),
            ) {
                warn!(batch_id = %batch.batch_id, error = %e, "Failed to publish requeue");
            }
        }

        let reason = context
            .reason
            .clone()
            .or_else(|| Some(format!("{requeued} work items requeued")));
        self.finish_cas(outcome.cas, &update, &batch, reason).await
    }
}
