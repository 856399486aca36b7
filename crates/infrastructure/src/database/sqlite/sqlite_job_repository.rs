use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    entities::ScheduledJob,
    repositories::JobRepository,
    value_objects::{IntervalSpec, JobCounts, JobFilter, JobSchedule, NewJob, Page, Pagination},
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use super::{rollback, rows_or_not_found};
use crate::database::mapping::MappingHelpers;

const JOB_SELECT: &str = r#"
    SELECT j.id, j.name, j.description, j.task_function_id, tf.function_key AS task_function_key,
           j.job_type, j.interval_seconds, j.interval_minutes, j.interval_hours, j.interval_days,
           j.cron_expression, j.parameters, j.priority, j.max_instances, j.misfire_grace_time,
           j.coalesce_missed, j.is_enabled, j.is_active, j.is_primary, j.is_paused,
           j.created_by, j.created_at, j.updated_by, j.updated_at, j.last_run_at
    FROM scheduled_jobs j
    JOIN task_functions tf ON tf.id = j.task_function_id
"#;

/// 调度参数拆分为存储列：四个间隔列与CRON列互斥
struct ScheduleColumns<'a> {
    seconds: Option<i64>,
    minutes: Option<i64>,
    hours: Option<i64>,
    days: Option<i64>,
    cron_expression: Option<&'a str>,
}

impl<'a> ScheduleColumns<'a> {
    fn from_schedule(schedule: &'a JobSchedule) -> Self {
        let interval = schedule.interval();
        Self {
            seconds: interval.map(|s| s.seconds),
            minutes: interval.map(|s| s.minutes),
            hours: interval.map(|s| s.hours),
            days: interval.map(|s| s.days),
            cron_expression: schedule.cron_expression(),
        }
    }
}

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ScheduledJob> {
        let interval_seconds: Option<i64> = row.try_get("interval_seconds")?;
        let interval = match interval_seconds {
            Some(seconds) => Some(IntervalSpec {
                seconds,
                minutes: row.try_get::<Option<i64>, _>("interval_minutes")?.unwrap_or(0),
                hours: row.try_get::<Option<i64>, _>("interval_hours")?.unwrap_or(0),
                days: row.try_get::<Option<i64>, _>("interval_days")?.unwrap_or(0),
            }),
            None => None,
        };
        let cron_expression: Option<String> = row.try_get("cron_expression")?;

        Ok(ScheduledJob {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            task_function_id: row.try_get("task_function_id")?,
            task_function_key: row.try_get("task_function_key")?,
            job_type: row.try_get("job_type")?,
            schedule: JobSchedule::from_parts(interval, cron_expression)?,
            parameters: MappingHelpers::parse_parameters(row, "parameters")?,
            priority: row.try_get("priority")?,
            max_instances: row.try_get("max_instances")?,
            misfire_grace_time: row.try_get("misfire_grace_time")?,
            coalesce: row.try_get("coalesce_missed")?,
            is_enabled: row.try_get("is_enabled")?,
            is_active: row.try_get("is_active")?,
            is_primary: row.try_get("is_primary")?,
            is_paused: row.try_get("is_paused")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_by: row.try_get("updated_by")?,
            updated_at: row.try_get("updated_at")?,
            last_run_at: row.try_get("last_run_at")?,
        })
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
        if !filter.include_inactive {
            builder.push(" AND j.is_active = 1");
        }
        if let Some(is_enabled) = filter.is_enabled {
            builder.push(" AND j.is_enabled = ").push_bind(is_enabled);
        }
        if let Some(job_type) = filter.job_type {
            builder.push(" AND j.job_type = ").push_bind(job_type);
        }
        if let Some(task_function_id) = filter.task_function_id {
            builder
                .push(" AND j.task_function_id = ")
                .push_bind(task_function_id);
        }
    }

    async fn fetch_existing(&self, id: i64) -> SchedulerResult<ScheduledJob> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(id))
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job), fields(name = %job.name, job_type = ?job.job_type))]
    async fn create(&self, job: &NewJob) -> SchedulerResult<ScheduledJob> {
        let now = Utc::now();
        let columns = ScheduleColumns::from_schedule(&job.schedule);
        let parameters = serde_json::to_string(&job.parameters)?;

        let mut tx = self.pool.begin().await?;
        let inserted = async {
            if job.is_primary {
                sqlx::query(
                    "UPDATE scheduled_jobs SET is_primary = 0, updated_at = $2 WHERE name = $1 AND is_active = 1 AND is_primary = 1",
                )
                .bind(&job.name)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            let row = sqlx::query(
                r#"
                INSERT INTO scheduled_jobs (
                    name, description, task_function_id, job_type,
                    interval_seconds, interval_minutes, interval_hours, interval_days, cron_expression,
                    parameters, priority, max_instances, misfire_grace_time, coalesce_missed,
                    is_enabled, is_active, is_primary, is_paused,
                    created_by, created_at, updated_by, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 1, $16, 0, $17, $18, $17, $18)
                RETURNING id
                "#,
            )
            .bind(&job.name)
            .bind(&job.description)
            .bind(job.task_function_id)
            .bind(job.job_type)
            .bind(columns.seconds)
            .bind(columns.minutes)
            .bind(columns.hours)
            .bind(columns.days)
            .bind(columns.cron_expression)
            .bind(parameters)
            .bind(job.priority)
            .bind(job.max_instances)
            .bind(job.misfire_grace_time)
            .bind(job.coalesce)
            .bind(job.is_enabled)
            .bind(job.is_primary)
            .bind(job.created_by)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            let id: i64 = row.try_get("id")?;
            Ok::<i64, SchedulerError>(id)
        }
        .await;
        let id = match inserted {
            Ok(id) => id,
            Err(e) => return Err(rollback(tx, e).await),
        };

        tx.commit().await?;

        debug!(job_id = id, "作业已创建");
        self.fetch_existing(id).await
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<ScheduledJob>> {
        let row = sqlx::query(&format!("{JOB_SELECT} WHERE j.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> SchedulerResult<Page<ScheduledJob>> {
        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM scheduled_jobs j WHERE 1 = 1");
        Self::push_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut builder = QueryBuilder::<Sqlite>::new(JOB_SELECT);
        builder.push(" WHERE 1 = 1");
        Self::push_filters(&mut builder, filter);
        builder
            .push(" ORDER BY j.priority DESC, j.id ASC LIMIT ")
            .push_bind(pagination.limit())
            .push(" OFFSET ")
            .push_bind(pagination.offset());

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Page::new(items, total, pagination))
    }

    #[instrument(skip(self, job), fields(job_id = job.id))]
    async fn update(&self, job: &ScheduledJob) -> SchedulerResult<ScheduledJob> {
        let now = Utc::now();
        let columns = ScheduleColumns::from_schedule(&job.schedule);
        let parameters = serde_json::to_string(&job.parameters)?;

        let mut tx = self.pool.begin().await?;
        let updated = async {
            let result = sqlx::query(
                r#"
                UPDATE scheduled_jobs SET
                    name = $2, description = $3, task_function_id = $4, job_type = $5,
                    interval_seconds = $6, interval_minutes = $7, interval_hours = $8, interval_days = $9,
                    cron_expression = $10, parameters = $11, priority = $12, max_instances = $13,
                    misfire_grace_time = $14, coalesce_missed = $15, is_enabled = $16, is_primary = $17,
                    updated_by = $18, updated_at = $19
                WHERE id = $1 AND is_active = 1
                "#,
            )
            .bind(job.id)
            .bind(&job.name)
            .bind(&job.description)
            .bind(job.task_function_id)
            .bind(job.job_type)
            .bind(columns.seconds)
            .bind(columns.minutes)
            .bind(columns.hours)
            .bind(columns.days)
            .bind(columns.cron_expression)
            .bind(parameters)
            .bind(job.priority)
            .bind(job.max_instances)
            .bind(job.misfire_grace_time)
            .bind(job.coalesce)
            .bind(job.is_enabled)
            .bind(job.is_primary)
            .bind(job.updated_by)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            rows_or_not_found(result.rows_affected(), || SchedulerError::job_not_found(job.id))?;

            if job.is_primary {
                sqlx::query(
                    "UPDATE scheduled_jobs SET is_primary = 0, updated_at = $3 WHERE name = $1 AND id <> $2 AND is_active = 1 AND is_primary = 1",
                )
                .bind(&job.name)
                .bind(job.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            Ok::<(), SchedulerError>(())
        }
        .await;
        if let Err(e) = updated {
            return Err(rollback(tx, e).await);
        }

        tx.commit().await?;
        self.fetch_existing(job.id).await
    }

    async fn set_enabled(
        &self,
        id: i64,
        enabled: bool,
        updated_by: Option<i64>,
    ) -> SchedulerResult<ScheduledJob> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET is_enabled = $2, updated_by = $3, updated_at = $4 WHERE id = $1 AND is_active = 1",
        )
        .bind(id)
        .bind(enabled)
        .bind(updated_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        rows_or_not_found(result.rows_affected(), || SchedulerError::job_not_found(id))?;

        self.fetch_existing(id).await
    }

    async fn set_paused(
        &self,
        id: i64,
        paused: bool,
        updated_by: Option<i64>,
    ) -> SchedulerResult<ScheduledJob> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET is_paused = $2, updated_by = $3, updated_at = $4 WHERE id = $1 AND is_active = 1",
        )
        .bind(id)
        .bind(paused)
        .bind(updated_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        rows_or_not_found(result.rows_affected(), || SchedulerError::job_not_found(id))?;

        self.fetch_existing(id).await
    }

    async fn soft_delete(&self, id: i64, updated_by: Option<i64>) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET is_active = 0, is_enabled = 0, updated_by = $2, updated_at = $3 WHERE id = $1 AND is_active = 1",
        )
        .bind(id)
        .bind(updated_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        rows_or_not_found(result.rows_affected(), || SchedulerError::job_not_found(id))?;

        debug!(job_id = id, "作业已软删除");
        Ok(())
    }

    async fn touch_last_run(&self, id: i64, at: DateTime<Utc>) -> SchedulerResult<()> {
        sqlx::query("UPDATE scheduled_jobs SET last_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn timer_driven_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let rows = sqlx::query(&format!(
            "{JOB_SELECT} WHERE j.is_active = 1 AND j.is_enabled = 1 AND j.is_paused = 0 AND j.is_primary = 1 ORDER BY j.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn counts(&self) -> SchedulerResult<JobCounts> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_jobs,
                   COALESCE(SUM(CASE WHEN is_enabled = 1 THEN 1 ELSE 0 END), 0) AS enabled_jobs
            FROM scheduled_jobs
            WHERE is_active = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_jobs: i64 = row.try_get("total_jobs")?;
        let enabled_jobs: i64 = row.try_get("enabled_jobs")?;
        Ok(JobCounts {
            total_jobs,
            enabled_jobs,
            disabled_jobs: total_jobs - enabled_jobs,
        })
    }
}
