use super::errors::{GuardError, GuardResult};
use super::events::BatchAction;
use super::states::WorkItemStatus;
use crate::database::BatchStore;
use crate::models::Batch;
use async_trait::async_trait;
use uuid::Uuid;

/// Precondition checked against the store before a transition is attempted
///
/// Guards read fresh counts on every check; the compare-and-set that follows
/// is what makes the decision stick, since any write that could invalidate the
/// guard also bumps the batch version.
#[async_trait]
pub trait StateGuard: Send + Sync {
    async fn check(&self, batch: &Batch, store: &dyn BatchStore) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// `run` needs at least one queued item
///
/// Items of a STAGED batch are claimable, so an item the dispatcher has
/// already claimed (PROCESSING) counts as well.
pub struct HasQueuedItemsGuard;

#[async_trait]
impl StateGuard for HasQueuedItemsGuard {
    async fn check(&self, batch: &Batch, store: &dyn BatchStore) -> GuardResult<()> {
        let counts = store.count_work_items(batch.batch_id).await?;
        if counts.outstanding() == 0 {
            return Err(GuardError::NoQueuedItems);
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Batch must have at least one queued or claimed work item"
    }
}

/// `pause` only makes sense while work is queued or processing
pub struct HasInFlightItemsGuard;

#[async_trait]
impl StateGuard for HasInFlightItemsGuard {
    async fn check(&self, batch: &Batch, store: &dyn BatchStore) -> GuardResult<()> {
        let counts = store.count_work_items(batch.batch_id).await?;
        if counts.outstanding() == 0 {
            return Err(GuardError::NothingInFlight);
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Batch must have queued or processing work items"
    }
}

/// `complete` requires every item of the batch to be terminal
pub struct AllItemsTerminalGuard;

#[async_trait]
impl StateGuard for AllItemsTerminalGuard {
    async fn check(&self, batch: &Batch, store: &dyn BatchStore) -> GuardResult<()> {
        let counts = store.count_work_items(batch.batch_id).await?;
        let terminal = counts.terminal();
        if counts.outstanding() > 0 || terminal != batch.total_item_count {
            return Err(GuardError::ItemsOutstanding {
                terminal,
                total: batch.total_item_count,
            });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "All work items must be in a terminal status"
    }
}

/// `rerun` rebuilds items from the frozen snapshot
pub struct SnapshotPresentGuard;

#[async_trait]
impl StateGuard for SnapshotPresentGuard {
    async fn check(&self, batch: &Batch, _store: &dyn BatchStore) -> GuardResult<()> {
        match batch.configuration_snapshot {
            Some(_) => Ok(()),
            None => Err(GuardError::MissingSnapshot),
        }
    }

    fn description(&self) -> &'static str {
        "Batch must carry a configuration snapshot"
    }
}

/// `requeue` needs at least one FAILED or TIMEOUT item among the selection
pub struct HasRequeueableItemsGuard {
    pub work_item_ids: Option<Vec<Uuid>>,
}

#[async_trait]
impl StateGuard for HasRequeueableItemsGuard {
    async fn check(&self, batch: &Batch, store: &dyn BatchStore) -> GuardResult<()> {
        let requeueable = match &self.work_item_ids {
            None => {
                let counts = store.count_work_items(batch.batch_id).await?;
                WorkItemStatus::REQUEUEABLE
                    .iter()
                    .map(|status| counts.count(*status))
                    .sum::<i64>()
            }
            Some(ids) => store
                .list_work_items(batch.batch_id)
                .await?
                .iter()
                .filter(|item| ids.contains(&item.work_item_id))
                .filter(|item| WorkItemStatus::REQUEUEABLE.contains(&item.status))
                .count() as i64,
        };

        if requeueable == 0 {
            return Err(GuardError::NothingToRequeue);
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Batch must have failed or timed out work items to requeue"
    }
}

/// Guard protecting `action`, if it has one
pub fn guard_for(action: BatchAction, work_item_ids: Option<&[Uuid]>) -> Option<Box<dyn StateGuard>> {
    let guard: Box<dyn StateGuard> = match action {
        BatchAction::Run => Box::new(HasQueuedItemsGuard),
        BatchAction::Pause => Box::new(HasInFlightItemsGuard),
        BatchAction::Complete => Box::new(AllItemsTerminalGuard),
        BatchAction::Rerun => Box::new(SnapshotPresentGuard),
        BatchAction::Requeue => Box::new(HasRequeueableItemsGuard {
            work_item_ids: work_item_ids.map(<[Uuid]>::to_vec),
        }),
        _ => return None,
    };
    Some(guard)
}
