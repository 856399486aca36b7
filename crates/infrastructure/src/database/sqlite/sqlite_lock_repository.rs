use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    entities::{ExecutionLock, ExecutionStatus},
    repositories::LockRepository,
    value_objects::{LockAcquisition, LockRequest},
};
use scheduler_errors::SchedulerResult;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

pub struct SqliteLockRepository {
    pool: SqlitePool,
}

impl SqliteLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_lock(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ExecutionLock> {
        Ok(ExecutionLock {
            job_id: row.try_get("job_id")?,
            instance_id: row.try_get("instance_id")?,
            execution_id: MappingHelpers::parse_optional_uuid(row, "execution_id")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl LockRepository for SqliteLockRepository {
    #[instrument(skip(self, request), fields(
        job_id = request.job_id,
        instance_id = request.instance_id,
        execution_id = %request.execution_id,
    ))]
    async fn acquire_and_start(&self, request: &LockRequest) -> SchedulerResult<LockAcquisition> {
        let expires_at = request.now + request.ttl;

        // 事务的第一条语句即为写操作，避免读锁升级失败
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM execution_locks WHERE job_id = $1 AND expires_at <= $2")
            .bind(request.job_id)
            .bind(request.now)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO execution_locks (job_id, instance_id, execution_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(request.job_id)
        .bind(request.instance_id)
        .bind(request.execution_id.to_string())
        .bind(request.now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let holder = sqlx::query(
                "SELECT job_id, instance_id, execution_id, acquired_at, expires_at FROM execution_locks WHERE job_id = $1",
            )
            .bind(request.job_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;

            return match holder {
                Some(row) => {
                    let lock = Self::row_to_lock(&row)?;
                    Ok(LockAcquisition::Held {
                        holder_instance_id: lock.instance_id,
                        expires_at: lock.expires_at,
                    })
                }
                None => Ok(LockAcquisition::Held {
                    holder_instance_id: 0,
                    expires_at,
                }),
            };
        }

        let started = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, started_at = $3, run_id = $4, executor_id = $5, host_name = $6
            WHERE execution_id = $1
              AND status = 'pending'
              AND EXISTS (SELECT 1 FROM execution_statuses s WHERE s.code = $2 AND s.is_active = 1)
            "#,
        )
        .bind(request.execution_id.to_string())
        .bind(ExecutionStatus::Running)
        .bind(request.now)
        .bind(&request.run_id)
        .bind(request.instance_id)
        .bind(&request.host_name)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if started == 0 {
            tx.rollback().await?;
            return Ok(LockAcquisition::ExecutionNotPending);
        }

        tx.commit().await?;
        debug!("锁已获取，执行转入 running");

        Ok(LockAcquisition::Acquired(ExecutionLock {
            job_id: request.job_id,
            instance_id: request.instance_id,
            execution_id: Some(request.execution_id),
            acquired_at: request.now,
            expires_at,
        }))
    }

    async fn release(&self, job_id: i64, instance_id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM execution_locks WHERE job_id = $1 AND instance_id = $2")
            .bind(job_id)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_all_for_instance(&self, instance_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM execution_locks WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>> {
        let row = sqlx::query(
            "SELECT job_id, instance_id, execution_id, acquired_at, expires_at FROM execution_locks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_lock).transpose()
    }

    async fn delete_abandoned(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM execution_locks
            WHERE expires_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM scheduler_instances i
                  WHERE i.id = execution_locks.instance_id
                    AND i.status <> 'stopped'
                    AND i.last_heartbeat >= $2
              )
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
