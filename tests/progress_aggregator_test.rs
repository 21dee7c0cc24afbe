mod common;

use batchflow_core::constants::events;
use batchflow_core::database::BatchStore;
use batchflow_core::models::WorkItemResult;
use batchflow_core::state_machine::{BatchAction, BatchStatus, WorkItemEvent, WorkItemStatus};
use chrono::Utc;
use common::*;

fn succeeded() -> WorkItemEvent {
    WorkItemEvent::Succeeded(WorkItemResult::default())
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let engine = TestEngine::with_documents(&["doc-1", "doc-2"], ScriptedInference::new());
    let batch = engine.completed_batch("twice").await;
    let transitions = engine.store.list_transitions(batch.batch_id).await.unwrap().len();

    for _ in 0..3 {
        let snapshot = engine.aggregator.recompute(batch.batch_id).await.unwrap();
        assert!(!snapshot.completed);
        assert_eq!(snapshot.status, BatchStatus::Completed);
        assert_eq!(snapshot.processed_item_count, 2);
    }

    let after = engine.batch(batch.batch_id).await;
    assert_eq!(after.version, batch.version);
    assert_eq!(after.completed_at, batch.completed_at);
    assert_eq!(
        engine.store.list_transitions(batch.batch_id).await.unwrap().len(),
        transitions
    );
}

#[tokio::test]
async fn test_recompute_counts_without_completing_partial_batch() {
    let engine = TestEngine::with_documents(&["doc-1", "doc-2", "doc-3"], ScriptedInference::new());
    let batch = engine.running_batch("partial").await;

    let item = engine.claim_at(Utc::now()).await.unwrap();
    engine
        .controller
        .report_work_item(item.work_item_id, succeeded())
        .await
        .unwrap();

    let snapshot = engine.aggregator.recompute(batch.batch_id).await.unwrap();
    assert!(!snapshot.completed);
    assert_eq!(snapshot.status, BatchStatus::Processing);
    assert_eq!(snapshot.processed_item_count, 1);
    assert_eq!(snapshot.total_item_count, 3);
    assert_eq!(snapshot.counts.count(WorkItemStatus::Queued), 2);
    assert_eq!(engine.batch(batch.batch_id).await.processed_item_count, 1);
}

#[tokio::test]
async fn test_paused_batch_accrues_progress_but_completes_after_resume() {
    let engine = TestEngine::with_documents(&["doc-1", "doc-2"], ScriptedInference::new());
    let batch = engine.running_batch("paused").await;

    let first = engine.claim_at(Utc::now()).await.unwrap();
    let second = engine.claim_at(Utc::now()).await.unwrap();
    assert!(engine.request(batch.batch_id, BatchAction::Pause).await.accepted);

    for item in [&first, &second] {
        engine
            .controller
            .report_work_item(item.work_item_id, succeeded())
            .await
            .unwrap();
    }

    let snapshot = engine.aggregator.recompute(batch.batch_id).await.unwrap();
    assert!(!snapshot.completed);
    assert_eq!(snapshot.status, BatchStatus::Paused);
    assert_eq!(snapshot.processed_item_count, 2);

    assert!(engine.request(batch.batch_id, BatchAction::Resume).await.accepted);
    let snapshot = engine.aggregator.recompute(batch.batch_id).await.unwrap();
    assert!(snapshot.completed);
    assert_eq!(snapshot.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_sweep_completes_only_finished_batches() {
    let engine = TestEngine::with_documents(&["doc-1"], ScriptedInference::new());
    let finished = engine.running_batch("finished").await;
    engine.finish_all(finished.batch_id, |_| succeeded()).await;
    let waiting = engine.running_batch("waiting").await;

    let snapshots = engine.aggregator.sweep().await.unwrap();
    assert_eq!(snapshots.len(), 2);

    let completed: Vec<_> = snapshots
        .iter()
        .filter(|snapshot| snapshot.completed)
        .map(|snapshot| snapshot.batch_id)
        .collect();
    assert_eq!(completed, vec![finished.batch_id]);
    assert_eq!(engine.batch(waiting.batch_id).await.status, BatchStatus::Processing);
}

#[tokio::test]
async fn test_recompute_publishes_progress() {
    let engine = TestEngine::with_documents(&["doc-1"], ScriptedInference::new());
    let batch = engine.running_batch("observed").await;
    let mut receiver = engine.events.subscribe();

    engine.aggregator.recompute(batch.batch_id).await.unwrap();

    let event = receiver.try_recv().unwrap();
    assert_eq!(event.name, events::BATCH_PROGRESS);
    assert_eq!(event.context["processed_item_count"], 0);
    assert_eq!(event.context["total_item_count"], 1);
    assert_eq!(event.context["status"], "PROCESSING");
}

#[tokio::test]
async fn test_recompute_of_unknown_batch_fails() {
    let engine = TestEngine::with_documents(&["doc-1"], ScriptedInference::new());
    assert!(engine.aggregator.recompute(uuid::Uuid::new_v4()).await.is_err());
}
