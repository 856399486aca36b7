use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    entities::{InstanceStatus, SchedulerInstance},
    repositories::InstanceRepository,
    value_objects::NewInstance,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::rows_or_not_found;

const INSTANCE_COLUMNS: &str =
    "id, instance_name, host_name, process_id, mode, status, last_heartbeat, started_at, stopped_at";

pub struct SqliteInstanceRepository {
    pool: SqlitePool,
}

impl SqliteInstanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<SchedulerInstance> {
        Ok(SchedulerInstance {
            id: row.try_get("id")?,
            instance_name: row.try_get("instance_name")?,
            host_name: row.try_get("host_name")?,
            process_id: row.try_get("process_id")?,
            mode: row.try_get("mode")?,
            status: row.try_get("status")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            started_at: row.try_get("started_at")?,
            stopped_at: row.try_get("stopped_at")?,
        })
    }

    fn instance_not_found(id: i64) -> SchedulerError {
        SchedulerError::NotFound {
            entity: "调度实例",
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl InstanceRepository for SqliteInstanceRepository {
    async fn register(&self, instance: &NewInstance) -> SchedulerResult<SchedulerInstance> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO scheduler_instances (instance_name, host_name, process_id, mode, status, last_heartbeat, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(&instance.instance_name)
        .bind(&instance.host_name)
        .bind(instance.process_id)
        .bind(instance.mode)
        .bind(InstanceStatus::Starting)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let registered = Self::row_to_instance(&row)?;
        debug!(instance_id = registered.id, name = %registered.instance_name, "调度实例已注册");
        Ok(registered)
    }

    async fn get(&self, id: i64) -> SchedulerResult<Option<SchedulerInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM scheduler_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn heartbeat(&self, id: i64, at: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduler_instances SET last_heartbeat = $2 WHERE id = $1 AND status <> 'stopped'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        rows_or_not_found(result.rows_affected(), || Self::instance_not_found(id))
    }

    async fn set_status(&self, id: i64, status: InstanceStatus) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE scheduler_instances SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        rows_or_not_found(result.rows_affected(), || Self::instance_not_found(id))
    }

    async fn mark_stopped(&self, id: i64, at: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduler_instances SET status = $2, stopped_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(InstanceStatus::Stopped)
        .bind(at)
        .execute(&self.pool)
        .await?;
        rows_or_not_found(result.rows_affected(), || Self::instance_not_found(id))
    }

    async fn list_live(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<SchedulerInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM scheduler_instances WHERE status <> 'stopped' AND last_heartbeat >= $1 ORDER BY id"
        ))
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn delete_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM scheduler_instances WHERE last_heartbeat < $1")
            .bind(stale_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
