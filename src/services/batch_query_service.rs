//! # Batch Query Service
//!
//! Read-only views for UI and operator tooling. Nothing here writes; every
//! mutation goes through [`crate::state_machine::StateMachineController`].

use crate::database::BatchStore;
use crate::error::{BatchflowError, BatchflowResult};
use crate::models::{Batch, BatchTransition, ConfigurationSnapshot, WorkItem};
use crate::state_machine::{allowed_actions, BatchAction, BatchStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Current status and progress of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch_id: Uuid,
    pub sequence_number: i64,
    pub name: String,
    pub status: BatchStatus,
    pub version: i64,
    pub processed_item_count: i64,
    pub total_item_count: i64,
    /// Work item count per status, statuses with no items omitted
    pub status_breakdown: BTreeMap<String, i64>,
    pub allowed_actions: Vec<BatchAction>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BatchQueryService {
    store: Arc<dyn BatchStore>,
}

impl BatchQueryService {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self { store }
    }

    pub async fn get_batch_status(&self, batch_id: Uuid) -> BatchflowResult<BatchStatusReport> {
        let batch = self.find(batch_id).await?;
        let counts = self.store.count_work_items(batch_id).await?;

        let status_breakdown = counts
            .by_status
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(status, count)| (status.as_str().to_string(), *count))
            .collect();

        Ok(BatchStatusReport {
            batch_id,
            sequence_number: batch.sequence_number,
            name: batch.name,
            status: batch.status,
            version: batch.version,
            processed_item_count: batch.processed_item_count,
            total_item_count: batch.total_item_count,
            status_breakdown,
            allowed_actions: allowed_actions(batch.status),
            created_at: batch.created_at,
            started_at: batch.started_at,
            completed_at: batch.completed_at,
        })
    }

    /// Snapshot frozen at the last staging, `None` before the batch was staged
    pub async fn get_config_snapshot(
        &self,
        batch_id: Uuid,
    ) -> BatchflowResult<Option<Arc<ConfigurationSnapshot>>> {
        let batch = self.find(batch_id).await?;
        Ok(batch.configuration_snapshot.map(Arc::new))
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> BatchflowResult<Batch> {
        self.find(batch_id).await
    }

    pub async fn list_batches(&self, statuses: &[BatchStatus]) -> BatchflowResult<Vec<Batch>> {
        Ok(self.store.list_batches(statuses).await?)
    }

    pub async fn list_work_items(&self, batch_id: Uuid) -> BatchflowResult<Vec<WorkItem>> {
        Ok(self.store.list_work_items(batch_id).await?)
    }

    /// Transition log of a batch in version order
    pub async fn list_transitions(&self, batch_id: Uuid) -> BatchflowResult<Vec<BatchTransition>> {
        Ok(self.store.list_transitions(batch_id).await?)
    }

    async fn find(&self, batch_id: Uuid) -> BatchflowResult<Batch> {
        self.store
            .find_batch(batch_id)
            .await?
            .ok_or(BatchflowError::BatchNotFound(batch_id))
    }
}
