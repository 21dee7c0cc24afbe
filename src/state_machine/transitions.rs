//! Batch transition table.
//!
//! The table answers two questions for the controller: where does an action
//! lead from a given status, and which operator actions are legal right now.
//! Preconditions that need store reads live in [`super::guards`].

use super::events::BatchAction;
use super::states::BatchStatus;

/// Resolve the status an action leads to, `None` when the action is illegal
///
/// `stage` and `restage` resolve to `STAGING`; the controller drives the
/// second half of staging (`STAGING -> STAGED` or `FAILED_STAGING`) itself.
pub fn target_status(from: BatchStatus, action: BatchAction) -> Option<BatchStatus> {
    use BatchAction as A;
    use BatchStatus as S;

    let target = match (from, action) {
        (S::Created | S::FailedStaging, A::Save) => S::Saved,

        (S::Saved, A::Stage) => S::Staging,
        (S::Completed | S::Failed, A::Restage) => S::Staging,
        (S::Completed | S::Failed, A::Rerun) => S::Staged,

        (S::Staged, A::Run) => S::Processing,
        (S::Processing, A::Pause) => S::Paused,
        (S::Paused, A::Resume) => S::Processing,
        (S::Processing | S::Paused, A::Cancel) => S::Failed,

        (S::Processing, A::Requeue) => S::Processing,
        (S::Paused, A::Requeue) => S::Paused,
        (S::Completed | S::Failed, A::Requeue) => S::Processing,

        (S::Processing, A::Complete) => S::Completed,
        (S::Saved | S::Staging | S::Processing, A::FailStaging) => S::FailedStaging,
        (S::Staging, A::ResetStaging) => S::Saved,

        _ => return None,
    };

    Some(target)
}

/// Operator-facing actions that are legal from `status`
///
/// Internal actions are never advertised even where the table allows them.
pub fn allowed_actions(status: BatchStatus) -> Vec<BatchAction> {
    BatchAction::ALL
        .into_iter()
        .filter(|action| !action.is_internal())
        .filter(|action| target_status(status, *action).is_some())
        .collect()
}
