use super::states::WorkItemStatus;
use crate::inference::TaskHandle;
use crate::models::{ErrorDetail, WorkItemResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Actions that request a batch state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    /// Operator saves a created (or failed-staging) batch
    Save,
    /// Resolve configuration, build work items and freeze the snapshot
    Stage,
    /// Start processing staged work items
    Run,
    /// Stop issuing new claims
    Pause,
    /// Resume issuing claims
    Resume,
    /// Stop the batch for good; in-flight items still resolve
    Cancel,
    /// Re-resolve configuration and rebuild all work items
    Restage,
    /// Rebuild all work items from the existing snapshot
    Rerun,
    /// Put failed and timed out items back into the queue
    Requeue,
    /// Internal: every work item reached a terminal status
    Complete,
    /// Internal: staging could not complete
    FailStaging,
    /// Internal: recovery resets an interrupted staging run
    ResetStaging,
}

impl BatchAction {
    pub const ALL: [BatchAction; 12] = [
        Self::Save,
        Self::Stage,
        Self::Run,
        Self::Pause,
        Self::Resume,
        Self::Cancel,
        Self::Restage,
        Self::Rerun,
        Self::Requeue,
        Self::Complete,
        Self::FailStaging,
        Self::ResetStaging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Stage => "stage",
            Self::Run => "run",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Restage => "restage",
            Self::Rerun => "rerun",
            Self::Requeue => "requeue",
            Self::Complete => "complete",
            Self::FailStaging => "fail_staging",
            Self::ResetStaging => "reset_staging",
        }
    }

    /// Internal actions are issued by the engine itself and never advertised to operators
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::FailStaging | Self::ResetStaging
        )
    }

    /// Actions that run the staging pipeline after entering STAGING
    pub fn runs_staging(&self) -> bool {
        matches!(self, Self::Stage | Self::Restage)
    }
}

impl fmt::Display for BatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("Invalid batch action: {s}"))
    }
}

/// Outcomes the dispatcher reports for a claimed work item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkItemEvent {
    /// The collaborator accepted the payload and returned a handle
    Submitted(TaskHandle),
    /// Terminal success with the inference result
    Succeeded(WorkItemResult),
    /// Terminal failure, either at submission or reported by the collaborator
    Failed(WorkItemResult),
    /// No terminal answer within the polling timeout
    TimedOut(ErrorDetail),
}

impl WorkItemEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Submitted(_) => "submitted",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timed_out",
        }
    }

    /// Status the item lands in, `None` when the event does not end the item
    pub fn terminal_status(&self) -> Option<WorkItemStatus> {
        match self {
            Self::Submitted(_) => None,
            Self::Succeeded(_) => Some(WorkItemStatus::Completed),
            Self::Failed(_) => Some(WorkItemStatus::Failed),
            Self::TimedOut(_) => Some(WorkItemStatus::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip_through_str() {
        for action in BatchAction::ALL {
            assert_eq!(action.as_str().parse::<BatchAction>().unwrap(), action);
        }
        assert!("explode".parse::<BatchAction>().is_err());
    }

    #[test]
    fn test_internal_actions() {
        assert!(BatchAction::Complete.is_internal());
        assert!(BatchAction::FailStaging.is_internal());
        assert!(BatchAction::ResetStaging.is_internal());
        assert!(!BatchAction::Requeue.is_internal());
    }

    #[test]
    fn test_action_serde_is_snake_case() {
        let json = serde_json::to_string(&BatchAction::FailStaging).unwrap();
        assert_eq!(json, "\"fail_staging\"");
    }
}
