use async_trait::async_trait;
use chrono::Utc;
use scheduler_domain::{
    entities::{ExecutionStatusInfo, JobType, TaskFunction},
    repositories::ReferenceDataRepository,
    value_objects::NewTaskFunction,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const TASK_FUNCTION_COLUMNS: &str = "id, function_key, implementation, version, name_en, name_ar, description, is_active, created_at";

pub struct SqliteReferenceDataRepository {
    pool: SqlitePool,
}

impl SqliteReferenceDataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task_function(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TaskFunction> {
        Ok(TaskFunction {
            id: row.try_get("id")?,
            key: row.try_get("function_key")?,
            implementation: row.try_get("implementation")?,
            version: row.try_get("version")?,
            name_en: row.try_get("name_en")?,
            name_ar: row.try_get("name_ar")?,
            description: row.try_get("description")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ReferenceDataRepository for SqliteReferenceDataRepository {
    async fn list_task_functions(&self, active_only: bool) -> SchedulerResult<Vec<TaskFunction>> {
        let sql = if active_only {
            format!("SELECT {TASK_FUNCTION_COLUMNS} FROM task_functions WHERE is_active = 1 ORDER BY function_key")
        } else {
            format!("SELECT {TASK_FUNCTION_COLUMNS} FROM task_functions ORDER BY function_key")
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task_function).collect()
    }

    async fn get_task_function(&self, id: i64) -> SchedulerResult<Option<TaskFunction>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_FUNCTION_COLUMNS} FROM task_functions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task_function).transpose()
    }

    async fn get_task_function_by_key(&self, key: &str) -> SchedulerResult<Option<TaskFunction>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_FUNCTION_COLUMNS} FROM task_functions WHERE function_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task_function).transpose()
    }

    async fn upsert_task_function(&self, function: &NewTaskFunction) -> SchedulerResult<TaskFunction> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO task_functions (function_key, implementation, version, name_en, name_ar, description, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7)
            ON CONFLICT(function_key) DO UPDATE SET
                implementation = excluded.implementation,
                version = excluded.version,
                name_en = excluded.name_en,
                name_ar = excluded.name_ar,
                description = excluded.description,
                is_active = 1
            RETURNING {TASK_FUNCTION_COLUMNS}
            "#
        ))
        .bind(&function.key)
        .bind(&function.implementation)
        .bind(function.version)
        .bind(&function.name_en)
        .bind(&function.name_ar)
        .bind(&function.description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        let task_function = Self::row_to_task_function(&row)?;
        debug!(key = %task_function.key, id = task_function.id, "任务函数已登记");
        Ok(task_function)
    }

    async fn list_job_types(&self) -> SchedulerResult<Vec<JobType>> {
        let rows = sqlx::query(
            "SELECT code, name_en, name_ar, description, is_active FROM job_types ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(JobType {
                    code: row.try_get("code")?,
                    name_en: row.try_get("name_en")?,
                    name_ar: row.try_get("name_ar")?,
                    description: row.try_get("description")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(SchedulerError::Database)
    }

    async fn list_execution_statuses(&self) -> SchedulerResult<Vec<ExecutionStatusInfo>> {
        let rows = sqlx::query(
            "SELECT code, name_en, name_ar, is_terminal, is_active, sort_order FROM execution_statuses ORDER BY sort_order",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExecutionStatusInfo {
                    code: row.try_get("code")?,
                    name_en: row.try_get("name_en")?,
                    name_ar: row.try_get("name_ar")?,
                    is_terminal: row.try_get("is_terminal")?,
                    is_active: row.try_get("is_active")?,
                    sort_order: row.try_get("sort_order")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(SchedulerError::Database)
    }
}
