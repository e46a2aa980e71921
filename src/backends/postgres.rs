//! Postgres ledger backed by the `workflow_executions` table.
//!
//! Acquisition is a create-if-absent insert: `ON CONFLICT DO NOTHING`
//! over the `(workflow_id, execution_number)` unique constraint, so the
//! database arbitrates concurrent schedulers and contention surfaces as
//! an absent `RETURNING` row rather than an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::base::{
    AcquireOutcome, AcquireRequest, CompleteError, ExecutionId, ExecutionLedger, ExecutionStatus,
    LedgerError, LedgerResult, WorkflowExecution, WorkflowRef, truncate_label,
};

/// Ledger that persists executions in Postgres.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database and run the embedded migrations.
    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, tenant_id, execution_number, status, \
     started, triggered_by, error, execution_time, results";

#[async_trait]
impl ExecutionLedger for PostgresLedger {
    async fn list_active_workflows(
        &self,
        tenant_scope: Option<&str>,
    ) -> LedgerResult<Vec<WorkflowRef>> {
        let rows = match tenant_scope {
            Some(tenant_id) => {
                sqlx::query_as::<_, WorkflowRow>(
                    r#"
                    SELECT id, tenant_id, interval
                    FROM workflows
                    WHERE is_deleted = FALSE
                      AND interval IS NOT NULL
                      AND interval > 0
                      AND tenant_id = $1
                    "#,
                )
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, WorkflowRow>(
                    r#"
                    SELECT id, tenant_id, interval
                    FROM workflows
                    WHERE is_deleted = FALSE
                      AND interval IS NOT NULL
                      AND interval > 0
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn try_acquire(
        &self,
        request: &AcquireRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<AcquireOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, tenant_id, execution_number, status, started, triggered_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workflow_id, execution_number) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.workflow_id)
        .bind(&request.tenant_id)
        .bind(request.execution_number)
        .bind(ExecutionStatus::InProgress.as_str())
        .bind(now)
        .bind(truncate_label(&request.triggered_by))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            return Ok(AcquireOutcome::Conflict);
        };
        let execution_id = ExecutionId(row.get("id"));

        if let Some(origin) = &request.origin {
            sqlx::query(
                r#"
                INSERT INTO execution_alert_links (execution_id, alert_fingerprint, event_id)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(execution_id.0)
            .bind(&origin.fingerprint)
            .bind(&origin.event_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(AcquireOutcome::Acquired(execution_id))
    }

    async fn last_completed(
        &self,
        workflow_id: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE workflow_id = $1
              AND status IN ('success', 'error', 'providers_not_configured')
              AND started >= $2
            ORDER BY execution_number DESC
            LIMIT 1
            "#
        ))
        .bind(workflow_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn execution_by_number(
        &self,
        workflow_id: &str,
        execution_number: i32,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE workflow_id = $1 AND execution_number = $2
            "#
        ))
        .bind(workflow_id)
        .bind(execution_number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn mark_timed_out(&self, execution_id: ExecutionId) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'timeout'
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(execution_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CompleteError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $4,
                error = $5,
                execution_time = CAST(FLOOR(EXTRACT(EPOCH FROM ($6::timestamptz - started))) AS BIGINT)
            WHERE tenant_id = $1
              AND workflow_id = $2
              AND id = $3
              AND status = 'in_progress'
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(execution_id.0)
        .bind(status.as_str())
        .bind(error.map(truncate_label))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing transitioned: distinguish a missing row from a row that
        // is already terminal.
        let existing = self
            .get_execution(tenant_id, workflow_id, execution_id)
            .await?;
        match existing {
            Some(_) => Err(CompleteError::AlreadyFinished(execution_id)),
            None => Err(CompleteError::NotFound(execution_id)),
        }
    }

    async fn record_results(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        results: Value,
    ) -> Result<(), CompleteError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET results = $4
            WHERE tenant_id = $1 AND workflow_id = $2 AND id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(execution_id.0)
        .bind(results)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        if result.rows_affected() == 0 {
            return Err(CompleteError::NotFound(execution_id));
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE tenant_id = $1 AND workflow_id = $2 AND id = $3
            "#
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(execution_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn list_recent_executions(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<WorkflowExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE tenant_id = $1 AND workflow_id = $2 AND started >= $3
            ORDER BY started DESC
            LIMIT $4
            "#
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(WorkflowExecution::try_from)
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    tenant_id: String,
    interval: i64,
}

impl From<WorkflowRow> for WorkflowRef {
    fn from(row: WorkflowRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            interval: row.interval,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: String,
    tenant_id: String,
    execution_number: i32,
    status: String,
    started: DateTime<Utc>,
    triggered_by: String,
    error: Option<String>,
    execution_time: Option<i64>,
    results: Option<Value>,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = LedgerError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = ExecutionStatus::parse(&row.status).ok_or_else(|| {
            LedgerError::Message(format!("unknown execution status: {}", row.status))
        })?;
        Ok(Self {
            id: ExecutionId(row.id),
            workflow_id: row.workflow_id,
            tenant_id: row.tenant_id,
            execution_number: row.execution_number,
            status,
            started: row.started,
            triggered_by: row.triggered_by,
            error: row.error,
            execution_time: row.execution_time,
            results: row.results,
        })
    }
}
