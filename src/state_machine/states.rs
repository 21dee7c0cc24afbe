use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Batch record exists but has not been saved by an operator
    Created,
    /// Batch is configured and ready to be staged
    Saved,
    /// Configuration is being resolved and work items are being built
    Staging,
    /// Work items exist and the configuration snapshot is frozen
    Staged,
    /// Work items are being claimed and submitted
    Processing,
    /// No new claims are issued; in-flight items still resolve
    Paused,
    /// No more work remains (regardless of item-level failures)
    Completed,
    /// Batch was cancelled
    Failed,
    /// Staging could not resolve the batch configuration
    FailedStaging,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 9] = [
        Self::Created,
        Self::Saved,
        Self::Staging,
        Self::Staged,
        Self::Processing,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::FailedStaging,
    ];

    /// Statuses whose queued work items may be claimed by the dispatcher
    pub const CLAIMABLE: [BatchStatus; 2] = [Self::Staged, Self::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Saved => "SAVED",
            Self::Staging => "STAGING",
            Self::Staged => "STAGED",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedStaging => "FAILED_STAGING",
        }
    }

    /// Check whether no work will happen without an operator action
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::FailedStaging)
    }

    /// Check whether the dispatcher may claim items of a batch in this status
    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

    /// Check whether items of this batch may still be in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Paused)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid batch status: {s}"))
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Created
    }
}

/// Work item lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Created,
    Encoded,
    /// Eligible for claiming
    Queued,
    /// Claimed by exactly one dispatcher worker
    Processing,
    Completed,
    Failed,
    /// The dispatcher gave up waiting for a terminal answer
    Timeout,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 7] = [
        Self::Created,
        Self::Encoded,
        Self::Queued,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Timeout,
    ];

    pub const TERMINAL: [WorkItemStatus; 3] = [Self::Completed, Self::Failed, Self::Timeout];

    /// Statuses an operator `requeue` puts back into the queue
    pub const REQUEUEABLE: [WorkItemStatus; 2] = [Self::Failed, Self::Timeout];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Encoded => "ENCODED",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Queued or processing: work that has not reached an outcome yet
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid work item status: {s}"))
    }
}

impl Default for WorkItemStatus {
    fn default() -> Self {
        Self::Created
    }
}
