//! # Active Task Registry
//!
//! In-memory record of every work item this process has claimed and not yet
//! finished. Each entry owns one permit of the global in-flight semaphore, so
//! dropping the entry is what frees a dispatcher slot.
//!
//! The registry is deliberately ephemeral: after a restart it is empty, and a
//! PROCESSING item without an entry is the recovery manager's orphan signal.

use crate::inference::TaskHandle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// A claimed work item owned by this dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTaskRecord {
    pub work_item_id: Uuid,
    pub batch_id: Uuid,
    /// `None` while the submission call is in flight
    pub external_task_handle: Option<TaskHandle>,
    pub claimed_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ActiveTaskRecord {
    pub fn claimed(work_item_id: Uuid, batch_id: Uuid, claimed_at: DateTime<Utc>) -> Self {
        Self {
            work_item_id,
            batch_id,
            external_task_handle: None,
            claimed_at,
            submitted_at: None,
        }
    }
}

#[derive(Debug)]
struct ActiveTask {
    record: ActiveTaskRecord,
    _permit: OwnedSemaphorePermit,
}

/// Concurrent map of active tasks plus the back-pressure semaphore
#[derive(Debug)]
pub struct ActiveTaskRegistry {
    tasks: DashMap<Uuid, ActiveTask>,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
}

impl ActiveTaskRegistry {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            slots: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Wait for a free in-flight slot; `None` once the registry is closed
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Track a freshly claimed item; the permit is released when it is removed
    pub fn register(&self, record: ActiveTaskRecord, permit: OwnedSemaphorePermit) {
        self.tasks.insert(
            record.work_item_id,
            ActiveTask {
                record,
                _permit: permit,
            },
        );
    }

    /// Attach the collaborator handle once submission succeeded
    pub fn mark_submitted(
        &self,
        work_item_id: Uuid,
        handle: TaskHandle,
        submitted_at: DateTime<Utc>,
    ) -> bool {
        match self.tasks.get_mut(&work_item_id) {
            Some(mut task) => {
                task.record.external_task_handle = Some(handle);
                task.record.submitted_at = Some(submitted_at);
                true
            }
            None => false,
        }
    }

    /// Drop a task and free its slot
    pub fn remove(&self, work_item_id: Uuid) -> Option<ActiveTaskRecord> {
        self.tasks
            .remove(&work_item_id)
            .map(|(_, task)| task.record)
    }

    pub fn get(&self, work_item_id: Uuid) -> Option<ActiveTaskRecord> {
        self.tasks
            .get(&work_item_id)
            .map(|task| task.record.clone())
    }

    pub fn contains(&self, work_item_id: Uuid) -> bool {
        self.tasks.contains_key(&work_item_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.tasks.iter().map(|entry| *entry.key()).collect()
    }

    pub fn records(&self) -> Vec<ActiveTaskRecord> {
        self.tasks
            .iter()
            .map(|entry| entry.value().record.clone())
            .collect()
    }

    pub fn count_for_batch(&self, batch_id: Uuid) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.value().record.batch_id == batch_id)
            .count()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Wake every waiter with `None`; used at shutdown
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slots_are_released_on_remove() {
        let registry = ActiveTaskRegistry::new(2);
        let batch_id = Uuid::new_v4();

        let first = Uuid::new_v4();
        let permit = registry.acquire_slot().await.unwrap();
        registry.register(ActiveTaskRecord::claimed(first, batch_id, Utc::now()), permit);
        let permit = registry.acquire_slot().await.unwrap();
        registry.register(
            ActiveTaskRecord::claimed(Uuid::new_v4(), batch_id, Utc::now()),
            permit,
        );

        assert_eq!(registry.available_slots(), 0);
        assert!(registry.try_acquire_slot().is_none());

        let removed = registry.remove(first).unwrap();
        assert_eq!(removed.work_item_id, first);
        assert_eq!(registry.available_slots(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_submitted_sets_handle() {
        let registry = ActiveTaskRegistry::new(1);
        let id = Uuid::new_v4();
        let permit = registry.try_acquire_slot().unwrap();
        registry.register(ActiveTaskRecord::claimed(id, Uuid::new_v4(), Utc::now()), permit);

        assert!(registry.mark_submitted(id, TaskHandle::new("task-1"), Utc::now()));
        let record = registry.get(id).unwrap();
        assert_eq!(record.external_task_handle, Some(TaskHandle::new("task-1")));
        assert!(record.submitted_at.is_some());

        assert!(!registry.mark_submitted(Uuid::new_v4(), TaskHandle::new("x"), Utc::now()));
    }

    #[tokio::test]
    async fn test_count_for_batch() {
        let registry = ActiveTaskRegistry::new(8);
        let busy = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        for batch_id in [busy, busy, quiet] {
            let permit = registry.try_acquire_slot().unwrap();
            registry.register(
                ActiveTaskRecord::claimed(Uuid::new_v4(), batch_id, Utc::now()),
                permit,
            );
        }

        assert_eq!(registry.count_for_batch(busy), 2);
        assert_eq!(registry.count_for_batch(quiet), 1);
        assert_eq!(registry.count_for_batch(Uuid::new_v4()), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let registry = Arc::new(ActiveTaskRegistry::new(1));
        let _held = registry.try_acquire_slot().unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire_slot().await })
        };
        tokio::task::yield_now().await;
        registry.close();

        assert!(waiter.await.unwrap().is_none());
    }
}
