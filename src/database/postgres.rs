//! # PostgreSQL Batch Store
//!
//! [`BatchStore`] on PostgreSQL via SQLx.
//!
//! ## Atomic Claiming
//!
//! The claim is a single `UPDATE ... FROM (SELECT ... FOR UPDATE OF wi SKIP LOCKED)`
//! statement: concurrent dispatchers never select the same row, and a worker
//! never waits on a row another worker is claiming. With a per-batch ceiling
//! the claim becomes a short transaction that also takes a per-batch advisory
//! lock and recounts the batch's PROCESSING items before the update.
//!
//! ## Compare-and-Set
//!
//! Status changes are `UPDATE batches ... WHERE batch_id = $1 AND version = $2`.
//! Zero affected rows means the version moved on; the current row is re-read
//! and returned as [`CasOutcome::Conflict`]. The transition log row is
//! inserted in the same transaction.

use super::errors::{corrupt, StoreResult};
use super::store::{
    BatchStore, CasOutcome, ClaimRequest, OrphanedItem, ProgressCounts, RequeueOutcome,
    RequeueSelection, StagedItems, StatusUpdate,
};
use crate::config::DatabaseConfig;
use crate::models::{
    Batch, BatchTransition, ConfigurationSnapshot, NewBatch, WorkItem, WorkItemResult,
};
use crate::state_machine::{BatchStatus, WorkItemStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the database section of the configuration
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "💾 Connected batch store to PostgreSQL"
        );

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Batch store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    batch_id: Uuid,
    sequence_number: i64,
    name: String,
    metadata: Value,
    status: String,
    configuration_snapshot: Option<Value>,
    total_item_count: i64,
    processed_item_count: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<BatchRow> for Batch {
    type Error = super::errors::StoreError;

    fn try_from(row: BatchRow) -> StoreResult<Self> {
        let status = row
            .status
            .parse::<BatchStatus>()
            .map_err(|e| corrupt("batches", row.batch_id, e))?;
        let configuration_snapshot = match row.configuration_snapshot {
            Some(value) => Some(ConfigurationSnapshot::from_json(value).ok_or_else(|| {
                corrupt("batches", row.batch_id, "configuration_snapshot is not an object")
            })?),
            None => None,
        };

        Ok(Batch {
            batch_id: row.batch_id,
            sequence_number: row.sequence_number,
            name: row.name,
            metadata: row.metadata,
            status,
            configuration_snapshot,
            total_item_count: row.total_item_count,
            processed_item_count: row.processed_item_count,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkItemRow {
    work_item_id: Uuid,
    batch_id: Uuid,
    document_id: String,
    connection_id: String,
    prompt_id: String,
    payload: Value,
    status: String,
    external_task_handle: Option<String>,
    queued_at: Option<DateTime<Utc>>,
    started_processing_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = super::errors::StoreError;

    fn try_from(row: WorkItemRow) -> StoreResult<Self> {
        let status = row
            .status
            .parse::<WorkItemStatus>()
            .map_err(|e| corrupt("work_items", row.work_item_id, e))?;
        let result = row
            .result
            .map(serde_json::from_value::<WorkItemResult>)
            .transpose()?;

        Ok(WorkItem {
            work_item_id: row.work_item_id,
            batch_id: row.batch_id,
            document_id: row.document_id,
            connection_id: row.connection_id,
            prompt_id: row.prompt_id,
            payload: row.payload,
            status,
            external_task_handle: row.external_task_handle,
            queued_at: row.queued_at,
            started_processing_at: row.started_processing_at,
            completed_at: row.completed_at,
            result,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransitionRow {
    batch_id: Uuid,
    from_status: String,
    to_status: String,
    action: String,
    actor: String,
    reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for BatchTransition {
    type Error = super::errors::StoreError;

    fn try_from(row: TransitionRow) -> StoreResult<Self> {
        let bad = |e: String| corrupt("batch_transitions", row.batch_id, e);
        Ok(BatchTransition {
            batch_id: row.batch_id,
            from_status: row.from_status.parse().map_err(bad)?,
            to_status: row.to_status.parse().map_err(bad)?,
            action: row.action.parse().map_err(bad)?,
            actor: row.actor,
            reason: row.reason,
            version: row.version,
            created_at: row.created_at,
        })
    }
}

fn status_strings<T: ToString>(statuses: &[T]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

async fn select_batch(conn: &mut PgConnection, batch_id: Uuid) -> StoreResult<Option<Batch>> {
    sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE batch_id = $1")
        .bind(batch_id)
        .fetch_optional(conn)
        .await?
        .map(Batch::try_from)
        .transpose()
}

/// Version-checked status write plus its transition log row
async fn compare_and_set(conn: &mut PgConnection, update: &StatusUpdate) -> StoreResult<CasOutcome> {
    let row = sqlx::query_as::<_, BatchRow>(
        r#"
        UPDATE batches
        SET status = $3,
            version = version + 1,
            started_at = $4,
            completed_at = $5
        WHERE batch_id = $1 AND version = $2
        RETURNING *
        "#,
    )
    .bind(update.batch_id)
    .bind(update.expected_version)
    .bind(update.to_status.as_str())
    .bind(update.started_at)
    .bind(update.completed_at)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(match select_batch(conn, update.batch_id).await? {
            Some(current) => CasOutcome::Conflict(current),
            None => CasOutcome::NotFound,
        });
    };

    let transition = update.transition_record();
    sqlx::query(
        r#"
        INSERT INTO batch_transitions
            (batch_id, from_status, to_status, action, actor, reason, version, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(transition.batch_id)
    .bind(transition.from_status.as_str())
    .bind(transition.to_status.as_str())
    .bind(transition.action.as_str())
    .bind(&transition.actor)
    .bind(&transition.reason)
    .bind(transition.version)
    .bind(transition.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(CasOutcome::Applied(row.try_into()?))
}

async fn refresh_processed(conn: &mut PgConnection, batch_id: Uuid) -> StoreResult<Option<Batch>> {
    sqlx::query_as::<_, BatchRow>(
        r#"
        UPDATE batches b
        SET processed_item_count = (
            SELECT COUNT(*)
            FROM work_items w
            WHERE w.batch_id = b.batch_id
              AND w.status = ANY($2)
        )
        WHERE b.batch_id = $1
        RETURNING b.*
        "#,
    )
    .bind(batch_id)
    .bind(status_strings(&WorkItemStatus::TERMINAL))
    .fetch_optional(conn)
    .await?
    .map(Batch::try_from)
    .transpose()
}

impl PgBatchStore {
    async fn claim_any(&self, request: &ClaimRequest) -> StoreResult<Option<WorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            WITH next_item AS (
                SELECT wi.work_item_id
                FROM work_items wi
                JOIN batches b ON b.batch_id = wi.batch_id
                WHERE wi.status = 'QUEUED'
                  AND b.status = ANY($1)
                ORDER BY wi.queued_at, wi.work_item_id
                LIMIT 1
                FOR UPDATE OF wi SKIP LOCKED
            )
            UPDATE work_items w
            SET status = 'PROCESSING',
                started_processing_at = $2
            FROM next_item
            WHERE w.work_item_id = next_item.work_item_id
            RETURNING w.*
            "#,
        )
        .bind(status_strings(&request.batch_statuses))
        .bind(request.claimed_at)
        .fetch_optional(&self.pool)
        .await?
        .map(WorkItem::try_from)
        .transpose()
    }

    /// Claim honouring a per-batch PROCESSING ceiling
    ///
    /// Claimers of one batch serialize on a transaction-scoped advisory lock,
    /// and the in-flight count is re-read after the lock is held, so it sees
    /// every claim committed before ours.
    async fn claim_within_limit(
        &self,
        request: &ClaimRequest,
        limit: i64,
    ) -> StoreResult<Option<WorkItem>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT wi.work_item_id, wi.batch_id
            FROM work_items wi
            JOIN batches b ON b.batch_id = wi.batch_id
            WHERE wi.status = 'QUEUED'
              AND b.status = ANY($1)
              AND (
                  SELECT COUNT(*)
                  FROM work_items p
                  WHERE p.batch_id = wi.batch_id
                    AND p.status = 'PROCESSING'
              ) < $2
            ORDER BY wi.queued_at, wi.work_item_id
            LIMIT 1
            FOR UPDATE OF wi SKIP LOCKED
            "#,
        )
        .bind(status_strings(&request.batch_statuses))
        .bind(limit)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((work_item_id, batch_id)) = candidate else {
            return Ok(None);
        };

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;

        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM work_items WHERE batch_id = $1 AND status = 'PROCESSING'",
        )
        .bind(batch_id)
        .fetch_one(&mut *tx)
        .await?;
        if in_flight >= limit {
            debug!(batch_id = %batch_id, in_flight, "Batch reached its in-flight ceiling during claim");
            return Ok(None);
        }

        let row = sqlx::query_as::<_, WorkItemRow>(
            r#"
            UPDATE work_items
            SET status = 'PROCESSING',
                started_processing_at = $2
            WHERE work_item_id = $1
            RETURNING *
            "#,
        )
        .bind(work_item_id)
        .bind(request.claimed_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        WorkItem::try_from(row).map(Some)
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn insert_batch(&self, batch: NewBatch, created_at: DateTime<Utc>) -> StoreResult<Batch> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            INSERT INTO batches (batch_id, name, metadata, status, created_at, version)
            VALUES ($1, $2, $3, $4, $5, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&batch.name)
        .bind(&batch.metadata)
        .bind(BatchStatus::Created.as_str())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn find_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        let mut conn = self.pool.acquire().await?;
        select_batch(&mut conn, batch_id).await
    }

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        sqlx::query_as::<_, BatchRow>(
            "SELECT * FROM batches WHERE status = ANY($1) ORDER BY sequence_number",
        )
        .bind(status_strings(statuses))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Batch::try_from)
        .collect()
    }

    async fn compare_and_set_status(&self, update: StatusUpdate) -> StoreResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = compare_and_set(&mut tx, &update).await?;
        if outcome.is_applied() {
            tx.commit().await?;
        }
        Ok(outcome)
    }

    async fn replace_work_items(
        &self,
        update: StatusUpdate,
        staged: StagedItems,
    ) -> StoreResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = compare_and_set(&mut tx, &update).await?;
        if !outcome.is_applied() {
            return Ok(outcome);
        }

        sqlx::query("DELETE FROM work_items WHERE batch_id = $1")
            .bind(update.batch_id)
            .execute(&mut *tx)
            .await?;

        let total = staged.items.len() as i64;
        for item in &staged.items {
            sqlx::query(
                r#"
                INSERT INTO work_items
                    (work_item_id, batch_id, document_id, connection_id, prompt_id,
                     payload, status, queued_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(update.batch_id)
            .bind(&item.document_id)
            .bind(&item.connection_id)
            .bind(&item.prompt_id)
            .bind(&item.payload)
            .bind(WorkItemStatus::Queued.as_str())
            .bind(staged.queued_at)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            UPDATE batches
            SET configuration_snapshot = COALESCE($2::jsonb, configuration_snapshot),
                total_item_count = $3,
                processed_item_count = 0
            WHERE batch_id = $1
            RETURNING *
            "#,
        )
        .bind(update.batch_id)
        .bind(staged.snapshot.as_ref().map(ConfigurationSnapshot::to_json))
        .bind(total)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CasOutcome::Applied(row.try_into()?))
    }

    async fn requeue_work_items(
        &self,
        update: StatusUpdate,
        selection: RequeueSelection,
    ) -> StoreResult<RequeueOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = compare_and_set(&mut tx, &update).await?;
        if !outcome.is_applied() {
            return Ok(RequeueOutcome {
                cas: outcome,
                requeued: 0,
            });
        }

        let requeued = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'QUEUED',
                external_task_handle = NULL,
                queued_at = $4,
                started_processing_at = NULL,
                completed_at = NULL,
                result = NULL
            WHERE batch_id = $1
              AND status = ANY($2)
              AND ($3::uuid[] IS NULL OR work_item_id = ANY($3))
            "#,
        )
        .bind(update.batch_id)
        .bind(status_strings(&selection.statuses))
        .bind(selection.work_item_ids.as_deref())
        .bind(selection.queued_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let cas = match refresh_processed(&mut tx, update.batch_id).await? {
            Some(batch) => CasOutcome::Applied(batch),
            None => CasOutcome::NotFound,
        };
        tx.commit().await?;
        Ok(RequeueOutcome { cas, requeued })
    }

    async fn claim_next_work_item(&self, request: ClaimRequest) -> StoreResult<Option<WorkItem>> {
        match request.per_batch_limit {
            Some(limit) => self.claim_within_limit(&request, limit as i64).await,
            None => self.claim_any(&request).await,
        }
    }

    async fn record_submission(&self, work_item_id: Uuid, handle: &str) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE work_items
            SET external_task_handle = $2
            WHERE work_item_id = $1
              AND status = 'PROCESSING'
              AND external_task_handle IS NULL
            "#,
        )
        .bind(work_item_id)
        .bind(handle)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn finish_work_item(
        &self,
        work_item_id: Uuid,
        status: WorkItemStatus,
        result: &WorkItemResult,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE work_items
            SET status = $2, result = $3, completed_at = $4
            WHERE work_item_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(work_item_id)
        .bind(status.as_str())
        .bind(serde_json::to_value(result)?)
        .bind(completed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn reset_orphaned_work_items(
        &self,
        cutoff: DateTime<Utc>,
        exclude: &[Uuid],
        queued_at: DateTime<Utc>,
    ) -> StoreResult<Vec<OrphanedItem>> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE work_items
            SET status = 'QUEUED',
                external_task_handle = NULL,
                queued_at = $3,
                started_processing_at = NULL
            WHERE status = 'PROCESSING'
              AND (started_processing_at IS NULL OR started_processing_at <= $1)
              AND NOT (work_item_id = ANY($2))
            RETURNING work_item_id, batch_id
            "#,
        )
        .bind(cutoff)
        .bind(exclude)
        .bind(queued_at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(work_item_id, batch_id)| OrphanedItem {
                work_item_id,
                batch_id,
            })
            .collect())
    }

    async fn count_work_items(&self, batch_id: Uuid) -> StoreResult<ProgressCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM work_items WHERE batch_id = $1 GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ProgressCounts::default();
        for (status, count) in rows {
            let status = status
                .parse::<WorkItemStatus>()
                .map_err(|e| corrupt("work_items", batch_id, e))?;
            counts.record(status, count);
        }
        Ok(counts)
    }

    async fn refresh_processed_count(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        let mut conn = self.pool.acquire().await?;
        refresh_processed(&mut conn, batch_id).await
    }

    async fn find_work_item(&self, work_item_id: Uuid) -> StoreResult<Option<WorkItem>> {
        sqlx::query_as::<_, WorkItemRow>("SELECT * FROM work_items WHERE work_item_id = $1")
            .bind(work_item_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkItem::try_from)
            .transpose()
    }

    async fn list_work_items(&self, batch_id: Uuid) -> StoreResult<Vec<WorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM work_items
            WHERE batch_id = $1
            ORDER BY document_id, connection_id, prompt_id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(WorkItem::try_from)
        .collect()
    }

    async fn list_transitions(&self, batch_id: Uuid) -> StoreResult<Vec<BatchTransition>> {
        sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT batch_id, from_status, to_status, action, actor, reason, version, created_at
            FROM batch_transitions
            WHERE batch_id = $1
            ORDER BY version
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(BatchTransition::try_from)
        .collect()
    }
}
