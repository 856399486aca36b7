use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_domain::{
    entities::{ExecutionStatus, JobExecution},
    repositories::ExecutionRepository,
    value_objects::{
        CreateExecutionResult, ExecutionFilter, ExecutionOutcome, NewExecution, Page, Pagination,
    },
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::is_unique_violation;
use crate::database::mapping::MappingHelpers;

const EXECUTION_COLUMNS: &str = "id, execution_id, job_id, run_id, trigger_source, triggered_by, parent_execution_id, \
    correlation_id, status, scheduled_at, started_at, completed_at, duration_ms, attempts, \
    error_message, error_traceback, result_summary, executor_id, host_name, created_at";

/// 目标状态码必须处于启用状态
const STATUS_IS_ACTIVE: &str =
    "EXISTS (SELECT 1 FROM execution_statuses s WHERE s.code = $STATUS AND s.is_active = 1)";

const ABANDONED_RUNNING_MESSAGE: &str = "abandoned: executor instance stopped heartbeating";
const ABANDONED_PENDING_MESSAGE: &str = "abandoned: no instance acquired the lock in time";

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobExecution> {
        Ok(JobExecution {
            id: row.try_get("id")?,
            execution_id: MappingHelpers::parse_uuid(row, "execution_id")?,
            job_id: row.try_get("job_id")?,
            run_id: row.try_get("run_id")?,
            trigger_source: row.try_get("trigger_source")?,
            triggered_by: row.try_get("triggered_by")?,
            parent_execution_id: MappingHelpers::parse_optional_uuid(row, "parent_execution_id")?,
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            attempts: row.try_get("attempts")?,
            error_message: row.try_get("error_message")?,
            error_traceback: row.try_get("error_traceback")?,
            result_summary: row.try_get("result_summary")?,
            executor_id: row.try_get("executor_id")?,
            host_name: row.try_get("host_name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn status_guard(placeholder: &str) -> String {
        STATUS_IS_ACTIVE.replace("$STATUS", placeholder)
    }

    async fn insert_if_idle(&self, execution: &NewExecution) -> SchedulerResult<Option<JobExecution>> {
        let sql = format!(
            r#"
            INSERT INTO job_executions (
                execution_id, job_id, trigger_source, triggered_by, parent_execution_id,
                correlation_id, status, scheduled_at, attempts, created_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, 0, $9
            WHERE NOT EXISTS (
                SELECT 1 FROM job_executions WHERE job_id = $2 AND status IN ('pending', 'running')
            )
            AND {}
            RETURNING {EXECUTION_COLUMNS}
            "#,
            Self::status_guard("$7")
        );

        let inserted = sqlx::query(&sql)
            .bind(execution.execution_id.to_string())
            .bind(execution.job_id)
            .bind(execution.trigger_source)
            .bind(execution.triggered_by)
            .bind(execution.parent_execution_id.map(|id| id.to_string()))
            .bind(&execution.correlation_id)
            .bind(ExecutionStatus::Pending)
            .bind(execution.scheduled_at)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await;

        match inserted {
            Ok(row) => row.as_ref().map(Self::row_to_execution).transpose(),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// 条件迁移未命中时区分“不存在”与“状态不允许”
    async fn transition_rejected(
        &self,
        execution_id: Uuid,
        target: ExecutionStatus,
    ) -> SchedulerError {
        match self.get(execution_id).await {
            Ok(Some(current)) => SchedulerError::validation_error(format!(
                "execution {execution_id} is {}, cannot transition to {target}",
                current.status
            )),
            Ok(None) => SchedulerError::execution_not_found(execution_id),
            Err(e) => e,
        }
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ExecutionFilter) {
        if let Some(job_id) = filter.job_id {
            builder.push(" AND job_id = ").push_bind(job_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(from) = filter.from {
            builder.push(" AND scheduled_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND scheduled_at <= ").push_bind(to);
        }
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    #[instrument(skip(self, execution), fields(
        job_id = execution.job_id,
        execution_id = %execution.execution_id,
        trigger_source = %execution.trigger_source,
    ))]
    async fn create_if_idle(
        &self,
        execution: &NewExecution,
    ) -> SchedulerResult<CreateExecutionResult> {
        // 未插入时读取冲突记录；冲突记录可能恰好结束，此时重试插入
        for _ in 0..3 {
            if let Some(created) = self.insert_if_idle(execution).await? {
                debug!("pending 执行记录已创建");
                return Ok(CreateExecutionResult::Created(created));
            }
            if let Some(active) = self.find_active_for_job(execution.job_id).await? {
                return Ok(CreateExecutionResult::Duplicate {
                    conflicting_execution_id: active.execution_id,
                });
            }
        }

        warn!("pending 执行记录未能写入");
        Err(SchedulerError::validation_error(format!(
            "could not create execution for job {}: pending status unavailable",
            execution.job_id
        )))
    }

    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<JobExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE execution_id = $1"
        ))
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn find_active_for_job(&self, job_id: i64) -> SchedulerResult<Option<JobExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE job_id = $1 AND status IN ('pending', 'running') LIMIT 1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn list(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> SchedulerResult<Page<JobExecution>> {
        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM job_executions WHERE 1 = 1");
        Self::push_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE 1 = 1"
        ));
        Self::push_filters(&mut builder, filter);
        builder
            .push(" ORDER BY scheduled_at DESC, id DESC LIMIT ")
            .push_bind(pagination.limit())
            .push(" OFFSET ")
            .push_bind(pagination.offset());

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(Self::row_to_execution)
            .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Page::new(items, total, pagination))
    }

    async fn recent(&self, limit: i64) -> SchedulerResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn mark_skipped(&self, execution_id: Uuid, reason: &str) -> SchedulerResult<JobExecution> {
        let sql = format!(
            r#"
            UPDATE job_executions
            SET status = $2, completed_at = $3, error_message = $4
            WHERE execution_id = $1 AND status = 'pending' AND {}
            RETURNING {EXECUTION_COLUMNS}
            "#,
            Self::status_guard("$2")
        );
        let row = sqlx::query(&sql)
            .bind(execution_id.to_string())
            .bind(ExecutionStatus::Skipped)
            .bind(Utc::now())
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_execution(&row),
            None => Err(self
                .transition_rejected(execution_id, ExecutionStatus::Skipped)
                .await),
        }
    }

    async fn record_attempt(
        &self,
        execution_id: Uuid,
        executor_id: i64,
        attempts: i32,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE job_executions SET attempts = $3 WHERE execution_id = $1 AND executor_id = $2 AND status = 'running'",
        )
        .bind(execution_id.to_string())
        .bind(executor_id)
        .bind(attempts)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_rejected(execution_id, ExecutionStatus::Running)
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(execution_id = %execution_id, status = %outcome.status))]
    async fn complete(
        &self,
        execution_id: Uuid,
        executor_id: i64,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<JobExecution> {
        if !matches!(
            outcome.status,
            ExecutionStatus::Success | ExecutionStatus::Failed
        ) {
            return Err(SchedulerError::validation_error(format!(
                "{} is not a dispatch outcome",
                outcome.status
            )));
        }

        let sql = format!(
            r#"
            UPDATE job_executions
            SET status = $3, completed_at = $4, duration_ms = $5, attempts = $6,
                error_message = $7, error_traceback = $8, result_summary = $9
            WHERE execution_id = $1 AND executor_id = $2 AND status = 'running' AND {}
            RETURNING {EXECUTION_COLUMNS}
            "#,
            Self::status_guard("$3")
        );
        let row = sqlx::query(&sql)
            .bind(execution_id.to_string())
            .bind(executor_id)
            .bind(outcome.status)
            .bind(Utc::now())
            .bind(outcome.duration_ms)
            .bind(outcome.attempts)
            .bind(&outcome.error_message)
            .bind(&outcome.error_traceback)
            .bind(&outcome.result_summary)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_execution(&row),
            None => Err(self.transition_rejected(execution_id, outcome.status).await),
        }
    }

    async fn reap_abandoned(
        &self,
        job_id: Option<i64>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> SchedulerResult<u64> {
        let stale_before = now - staleness;
        let pending_before = now - staleness * 2;

        let mut tx = self.pool.begin().await?;

        let running = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'failed', completed_at = $2, error_message = $4
            WHERE status = 'running'
              AND ($1 IS NULL OR job_id = $1)
              AND NOT EXISTS (
                  SELECT 1 FROM scheduler_instances i
                  WHERE i.id = job_executions.executor_id
                    AND i.status <> 'stopped'
                    AND i.last_heartbeat >= $3
              )
              AND NOT EXISTS (
                  SELECT 1 FROM execution_locks l
                  WHERE l.job_id = job_executions.job_id AND l.expires_at > $2
              )
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(stale_before)
        .bind(ABANDONED_RUNNING_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let pending = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'skipped', completed_at = $2, error_message = $4
            WHERE status = 'pending'
              AND ($1 IS NULL OR job_id = $1)
              AND created_at < $3
              AND NOT EXISTS (
                  SELECT 1 FROM execution_locks l
                  WHERE l.job_id = job_executions.job_id AND l.expires_at > $2
              )
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(pending_before)
        .bind(ABANDONED_PENDING_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if running + pending > 0 {
            warn!(job_id = ?job_id, running, pending, "已回收失联的执行记录");
        }
        Ok(running + pending)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_executions
            WHERE status IN ('success', 'failed', 'skipped')
              AND COALESCE(completed_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
