//! # Recovery Manager
//!
//! Reconciles state a previous process left behind. Active task records live
//! only in memory, so after a restart every PROCESSING item is an orphan
//! unless this process has registered it.
//!
//! ## Startup Pass
//!
//! Runs once before the dispatcher claims anything:
//!
//! 1. STAGING batches are reset to SAVED (staging is not resumable).
//! 2. PROCESSING batches are recomputed, which completes the ones whose items
//!    all finished before the crash. Nothing is downgraded.
//! 3. PROCESSING items without an active record whose claim is older than the
//!    staleness threshold go back to QUEUED with their handle cleared.
//!
//! ## Periodic Pass
//!
//! With `recovery.interval_seconds` set, steps 2 and 3 repeat on that
//! interval. The staging reset never repeats: a live process may be staging
//! right now. With a staleness threshold but no interval, a single deferred
//! pass runs once the grace period has passed so items skipped at startup
//! are not stranded.
//!
//! This is the only component that resets PROCESSING items to QUEUED.

use super::active_tasks::ActiveTaskRegistry;
use super::progress_aggregator::ProgressAggregator;
use crate::config::RecoveryConfig;
use crate::constants::{actors, events};
use crate::database::OrphanedItem;
use crate::error::BatchflowResult;
use crate::state_machine::{BatchAction, BatchStatus, StateMachineController, TransitionContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a recovery pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// STAGING batches reset to SAVED
    pub staging_reset: Vec<Uuid>,
    pub batches_recomputed: usize,
    pub batches_completed: Vec<Uuid>,
    pub items_reset: Vec<OrphanedItem>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        self.staging_reset.is_empty()
            && self.batches_completed.is_empty()
            && self.items_reset.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    controller: StateMachineController,
    aggregator: ProgressAggregator,
    registry: Arc<ActiveTaskRegistry>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        controller: StateMachineController,
        aggregator: ProgressAggregator,
        registry: Arc<ActiveTaskRegistry>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            controller,
            aggregator,
            registry,
            config,
        }
    }

    /// Full pass run at process start
    pub async fn recover_on_startup(&self) -> BatchflowResult<RecoveryReport> {
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        info!(
            staleness_threshold_seconds = self.config.staleness_threshold_seconds,
            "🔄 Running startup recovery"
        );

        let mut report = RecoveryReport {
            started_at: Some(started_at),
            ..RecoveryReport::default()
        };
        report.staging_reset = self.reset_interrupted_staging().await?;
        self.recompute_processing(&mut report).await?;
        report.items_reset = self.reset_orphans(started_at).await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.publish(&report);
        info!(
            staging_reset = report.staging_reset.len(),
            batches_recomputed = report.batches_recomputed,
            batches_completed = report.batches_completed.len(),
            items_reset = report.items_reset.len(),
            duration_ms = report.duration_ms,
            "Startup recovery finished"
        );
        Ok(report)
    }

    /// Orphan reset plus recompute, safe to run while the dispatcher is live
    pub async fn recover_orphans(&self) -> BatchflowResult<RecoveryReport> {
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        let mut report = RecoveryReport {
            started_at: Some(started_at),
            ..RecoveryReport::default()
        };
        report.items_reset = self.reset_orphans(started_at).await?;
        self.recompute_processing(&mut report).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.is_noop() {
            debug!("Periodic recovery found nothing to do");
        } else {
            self.publish(&report);
            info!(
                items_reset = report.items_reset.len(),
                batches_completed = report.batches_completed.len(),
                "Periodic recovery reconciled state"
            );
        }
        Ok(report)
    }

    /// Spawn the periodic (or single deferred) pass, if configured
    pub fn spawn_periodic(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let schedule = match (self.config.interval(), self.config.staleness_threshold()) {
            (Some(interval), _) => Schedule::Every(interval),
            (None, grace) if grace > Duration::ZERO => Schedule::Once(grace),
            _ => return None,
        };

        let manager = self.clone();
        Some(tokio::spawn(async move { manager.run_schedule(schedule, shutdown).await }))
    }

    async fn run_schedule(self, schedule: Schedule, mut shutdown: watch::Receiver<bool>) {
        let (delay, repeat) = match schedule {
            Schedule::Every(interval) => (interval, true),
            Schedule::Once(grace) => (grace, false),
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.recover_orphans().await {
                error!(error = %e, "Periodic recovery failed");
            }
            if !repeat {
                break;
            }
        }
        debug!("Recovery scheduler stopped");
    }

    async fn reset_interrupted_staging(&self) -> BatchflowResult<Vec<Uuid>> {
        let staging = self
            .controller
            .store()
            .list_batches(&[BatchStatus::Staging])
            .await?;

        let mut reset = Vec::with_capacity(staging.len());
        for batch in staging {
            let response = self
                .controller
                .request_with_retry(
                    batch.batch_id,
                    BatchAction::ResetStaging,
                    TransitionContext::system(actors::RECOVERY_MANAGER)
                        .with_reason("staging interrupted by restart"),
                )
                .await?;
            if response.accepted {
                reset.push(batch.batch_id);
            } else {
                warn!(batch_id = %batch.batch_id, reason = ?response.reason, "Could not reset interrupted staging");
            }
        }
        Ok(reset)
    }

    async fn recompute_processing(&self, report: &mut RecoveryReport) -> BatchflowResult<()> {
        let processing = self
            .controller
            .store()
            .list_batches(&[BatchStatus::Processing])
            .await?;

        for batch in processing {
            match self.aggregator.recompute(batch.batch_id).await {
                Ok(snapshot) => {
                    report.batches_recomputed += 1;
                    if snapshot.completed {
                        report.batches_completed.push(batch.batch_id);
                    }
                }
                Err(e) => error!(batch_id = %batch.batch_id, error = %e, "Recovery recompute failed"),
            }
        }
        Ok(())
    }

    async fn reset_orphans(&self, now: DateTime<Utc>) -> BatchflowResult<Vec<OrphanedItem>> {
        let threshold = chrono::Duration::from_std(self.config.staleness_threshold())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - threshold;
        let active = self.registry.active_ids();

        let reset = self
            .controller
            .reset_orphaned_work_items(cutoff, &active)
            .await?;
        if !reset.is_empty() {
            info!(count = reset.len(), cutoff = %cutoff, "Reset orphaned work items to QUEUED");
        }
        Ok(reset)
    }

    fn publish(&self, report: &RecoveryReport) {
        let context = match serde_json::to_value(report) {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "Could not serialize recovery report");
                return;
            }
        };
        if let Err(e) = self
            .controller
            .events()
            .publish(events::RECOVERY_COMPLETED, context)
        {
            warn!(error = %e, "Failed to publish recovery report");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Every(Duration),
    Once(Duration),
}
