//! PostgreSQL implementation of WorkflowEventStore
//!
//! Persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers
//! - Efficient task claiming with SKIP LOCKED
//! - Event sourcing for workflow replay

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::reliability::RetryDecision;
use crate::workflow::{ActivityOptions, HistoryEntry, WorkflowError, WorkflowEvent};

/// Embedded schema migrations for the durable tables
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL implementation of WorkflowEventStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use delaywatch_durable::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/delaywatch").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and build a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Error for a settle call that matched no row held by the caller
    async fn settle_rejected(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
    ) -> Result<StoreError, StoreError> {
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM durable_task_queue WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(match exists {
            Some(_) => StoreError::StaleClaim {
                task_id,
                worker_id: worker_id.to_string(),
                attempt,
            },
            None => StoreError::TaskNotFound(task_id),
        })
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, input))]
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO durable_workflow_instances (id, workflow_type, status, input)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .bind(&input)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            db_error(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowAlreadyExists(workflow_id));
        }

        debug!(%workflow_id, %workflow_type, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT status FROM durable_workflow_instances WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow status: {}", e);
            db_error(e)
        })?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let status: String = row.get("status");
        parse_workflow_status(&status)
    }

    #[instrument(skip(self))]
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input, result, error, created_at, updated_at
            FROM durable_workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow info: {}", e);
            db_error(e)
        })?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let status_str: String = row.get("status");
        let error_json: Option<serde_json::Value> = row.get("error");
        let error = error_json
            .map(serde_json::from_value::<WorkflowError>)
            .transpose()?;

        Ok(WorkflowInfo {
            id: row.get("id"),
            workflow_type: row.get("workflow_type"),
            status: parse_workflow_status(&status_str)?,
            input: row.get("input"),
            result: row.get("result"),
            error,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    #[instrument(skip(self))]
    async fn list_workflows(&self, statuses: &[WorkflowStatus]) -> Result<Vec<Uuid>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(ToString::to_string).collect();

        let rows = sqlx::query(
            r#"
            SELECT id FROM durable_workflow_instances
            WHERE status = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list workflows: {}", e);
            db_error(e)
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Lock the instance row so concurrent appenders serialize
        sqlx::query("SELECT id FROM durable_workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS next_seq
            FROM durable_workflow_events
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let current_sequence: i32 = row.get::<i64, _>("next_seq") as i32;

        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let mut new_sequence = current_sequence;
        for event in events {
            let event_data = serde_json::to_value(&event)?;

            sqlx::query(
                r#"
                INSERT INTO durable_workflow_events (workflow_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(workflow_id)
            .bind(new_sequence)
            .bind(event.type_name())
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            new_sequence += 1;
        }

        sqlx::query("UPDATE durable_workflow_instances SET updated_at = NOW() WHERE id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(%workflow_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data, recorded_at
            FROM durable_workflow_events
            WHERE workflow_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load events: {}", e);
            db_error(e)
        })?;

        if rows.is_empty() {
            // Distinguish "no events yet" from "no such workflow"
            self.get_workflow_status(workflow_id).await?;
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.get("event_data");
            events.push(HistoryEntry {
                sequence: row.get("sequence_num"),
                event: serde_json::from_value(data)?,
                recorded_at: row.get("recorded_at"),
            });
        }

        Ok(events)
    }

    #[instrument(skip(self, result, error))]
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let status_str = status.to_string();
        let error_json = error.map(serde_json::to_value).transpose()?;

        let (started_at, completed_at): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            match status {
                WorkflowStatus::Running => (Some(Utc::now()), None),
                WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                    (None, Some(Utc::now()))
                }
                WorkflowStatus::Pending => (None, None),
            };

        let updated = sqlx::query(
            r#"
            UPDATE durable_workflow_instances
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                started_at = COALESCE(started_at, $5),
                completed_at = COALESCE($6, completed_at),
                updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(workflow_id)
        .bind(&status_str)
        .bind(&result)
        .bind(&error_json)
        .bind(started_at)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update workflow status: {}", e);
            db_error(e)
        })?;

        if updated.rows_affected() == 0 {
            let current = self.get_workflow_status(workflow_id).await?;
            return Err(StoreError::WorkflowTerminal {
                workflow_id,
                status: current,
            });
        }

        debug!(%workflow_id, %status_str, "updated workflow status");
        Ok(())
    }

    #[instrument(
        skip(self, task),
        fields(workflow_id = %task.workflow_id, activity_id = %task.activity_id)
    )]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let options_json = serde_json::to_value(&task.options)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_task_queue (
                id, workflow_id, activity_id, activity_type, task_queue,
                input, options, max_attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workflow_id, activity_id) WHERE status IN ('pending', 'claimed')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(task.workflow_id)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(&task.task_queue)
        .bind(&task.input)
        .bind(&options_json)
        .bind(task.options.retry_policy.max_attempts as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue task: {}", e);
            db_error(e)
        })?;

        if let Some(row) = inserted {
            let task_id: Uuid = row.get("id");
            debug!(%task_id, activity_type = %task.activity_type, "enqueued task");
            return Ok(task_id);
        }

        let existing = sqlx::query(
            r#"
            SELECT id FROM durable_task_queue
            WHERE workflow_id = $1 AND activity_id = $2
              AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(task.workflow_id)
        .bind(&task.activity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let task_id: Uuid = existing.get("id");
        debug!(%task_id, "task already enqueued");
        Ok(task_id)
    }

    #[instrument(skip(self, activity_types))]
    async fn claim_task(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        if activity_types.is_empty() || max_tasks == 0 {
            return Ok(vec![]);
        }

        // SKIP LOCKED lets concurrent workers claim disjoint rows without waiting
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_task_queue
                WHERE status = 'pending'
                  AND task_queue = $1
                  AND activity_type = ANY($2)
                  AND visible_at <= NOW()
                ORDER BY visible_at, created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_task_queue t
            SET status = 'claimed',
                claimed_by = $4,
                claimed_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.workflow_id, t.activity_id, t.activity_type,
                      t.input, t.options, t.attempt, t.max_attempts
            "#,
        )
        .bind(task_queue)
        .bind(activity_types)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim tasks: {}", e);
            db_error(e)
        })?;

        let claimed = rows
            .iter()
            .map(claimed_task_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, _result))]
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = CASE WHEN status = 'cancelled' THEN status ELSE 'completed' END,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = $1
              AND claimed_by = $2
              AND attempt = $3
              AND status IN ('claimed', 'cancelled')
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete task: {}", e);
            db_error(e)
        })?;

        if updated.rows_affected() == 0 {
            return Err(self.settle_rejected(task_id, worker_id, attempt).await?);
        }

        debug!(%task_id, "completed task");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(
            r#"
            SELECT attempt, status, claimed_by, options
            FROM durable_task_queue
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let current_attempt = row.get::<i32, _>("attempt") as u32;
        let status: String = row.get("status");
        let claimed_by: Option<String> = row.get("claimed_by");
        let held = matches!(status.as_str(), "claimed" | "cancelled")
            && claimed_by.as_deref() == Some(worker_id)
            && current_attempt == attempt;
        if !held {
            return Err(StoreError::StaleClaim {
                task_id,
                worker_id: worker_id.to_string(),
                attempt,
            });
        }

        let options_json: serde_json::Value = row.get("options");
        let options: ActivityOptions = serde_json::from_value(options_json)?;
        let error_json = serde_json::to_value(error)?;

        let (outcome, new_status, visible_at) = if status == "cancelled" {
            (TaskFailureOutcome::NonRetryable, "cancelled", None)
        } else {
            match options.retry_policy.decide(attempt, error) {
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    let visible_at =
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    (
                        TaskFailureOutcome::WillRetry {
                            next_attempt,
                            delay,
                        },
                        "pending",
                        Some(visible_at),
                    )
                }
                RetryDecision::NonRetryable => (TaskFailureOutcome::NonRetryable, "failed", None),
                RetryDecision::Exhausted { .. } => (TaskFailureOutcome::Exhausted, "failed", None),
            }
        };

        sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                last_error = $3,
                visible_at = COALESCE($4, visible_at)
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(new_status)
        .bind(&error_json)
        .bind(visible_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(%task_id, attempt, ?outcome, "failed task attempt");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn cancel_tasks(&self, workflow_id: Uuid) -> Result<usize, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'cancelled'
            WHERE workflow_id = $1
              AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to cancel tasks: {}", e);
            db_error(e)
        })?;

        Ok(updated.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let threshold =
            Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                visible_at = NOW()
            WHERE status = 'claimed'
              AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stale tasks: {}", e);
            db_error(e)
        })?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale tasks");
        }

        Ok(reclaimed)
    }
}

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn parse_workflow_status(status: &str) -> Result<WorkflowStatus, StoreError> {
    WorkflowStatus::parse(status)
        .ok_or_else(|| StoreError::Serialization(format!("unknown workflow status: {status}")))
}

fn claimed_task_from_row(row: &PgRow) -> Result<ClaimedTask, StoreError> {
    let options_json: serde_json::Value = row.get("options");
    let options: ActivityOptions = serde_json::from_value(options_json)?;

    Ok(ClaimedTask {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        activity_id: row.get("activity_id"),
        activity_type: row.get("activity_type"),
        input: row.get("input"),
        options,
        attempt: row.get::<i32, _>("attempt") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
    })
}
