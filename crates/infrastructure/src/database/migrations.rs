//! SQLite 建表与参考数据初始化，可重复执行

use scheduler_domain::entities::{ExecutionStatus, JobKind};
use scheduler_errors::SchedulerResult;
use sqlx::SqlitePool;
use tracing::debug;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_functions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        function_key TEXT NOT NULL UNIQUE,
        implementation TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        name_en TEXT NOT NULL,
        name_ar TEXT NOT NULL,
        description TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_types (
        code TEXT PRIMARY KEY,
        name_en TEXT NOT NULL,
        name_ar TEXT NOT NULL,
        description TEXT,
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS execution_statuses (
        code TEXT PRIMARY KEY,
        name_en TEXT NOT NULL,
        name_ar TEXT NOT NULL,
        is_terminal INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        sort_order INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        task_function_id INTEGER NOT NULL REFERENCES task_functions(id),
        job_type TEXT NOT NULL REFERENCES job_types(code),
        interval_seconds INTEGER,
        interval_minutes INTEGER,
        interval_hours INTEGER,
        interval_days INTEGER,
        cron_expression TEXT,
        parameters TEXT NOT NULL DEFAULT '{}',
        priority INTEGER NOT NULL DEFAULT 0,
        max_instances INTEGER NOT NULL DEFAULT 1 CHECK (max_instances BETWEEN 1 AND 10),
        misfire_grace_time INTEGER NOT NULL DEFAULT 60,
        coalesce_missed INTEGER NOT NULL DEFAULT 1,
        is_enabled INTEGER NOT NULL DEFAULT 1,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_primary INTEGER NOT NULL DEFAULT 1,
        is_paused INTEGER NOT NULL DEFAULT 0,
        created_by INTEGER,
        created_at TEXT NOT NULL,
        updated_by INTEGER,
        updated_at TEXT NOT NULL,
        last_run_at TEXT,
        CHECK ((cron_expression IS NULL) <> (interval_seconds IS NULL))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL UNIQUE,
        job_id INTEGER NOT NULL REFERENCES scheduled_jobs(id),
        run_id TEXT,
        trigger_source TEXT NOT NULL,
        triggered_by INTEGER,
        parent_execution_id TEXT,
        correlation_id TEXT NOT NULL,
        status TEXT NOT NULL REFERENCES execution_statuses(code),
        scheduled_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        duration_ms INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        error_traceback TEXT,
        result_summary TEXT,
        executor_id INTEGER,
        host_name TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_instances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_name TEXT NOT NULL,
        host_name TEXT NOT NULL,
        process_id INTEGER NOT NULL,
        mode TEXT NOT NULL,
        status TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        started_at TEXT NOT NULL,
        stopped_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS execution_locks (
        job_id INTEGER PRIMARY KEY REFERENCES scheduled_jobs(id),
        instance_id INTEGER NOT NULL,
        execution_id TEXT,
        acquired_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    // 每个作业至多一条非终态执行
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_job_executions_one_active ON job_executions(job_id) WHERE status IN ('pending', 'running')",
    "CREATE INDEX IF NOT EXISTS idx_job_executions_job_id ON job_executions(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_job_executions_status ON job_executions(status)",
    "CREATE INDEX IF NOT EXISTS idx_job_executions_created_at ON job_executions(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_name ON scheduled_jobs(name)",
    "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_enabled ON scheduled_jobs(is_enabled, is_active)",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_instances_heartbeat ON scheduler_instances(last_heartbeat)",
    "CREATE INDEX IF NOT EXISTS idx_execution_locks_expires_at ON execution_locks(expires_at)",
];

/// 运行数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
    debug!("Running SQLite database migrations");

    for statement in TABLES {
        sqlx::query(statement).execute(pool).await?;
    }
    for index in INDEXES {
        sqlx::query(index).execute(pool).await?;
    }

    Ok(())
}

/// 写入作业类型与执行状态参考数据
pub async fn seed_reference_data(pool: &SqlitePool) -> SchedulerResult<()> {
    let job_types = [
        (
            JobKind::Interval,
            "Interval",
            "فاصل زمني",
            "Runs every fixed interval",
        ),
        (
            JobKind::Cron,
            "Cron",
            "جدول كرون",
            "Runs on a cron schedule",
        ),
    ];
    for (code, name_en, name_ar, description) in job_types {
        sqlx::query(
            r#"
            INSERT INTO job_types (code, name_en, name_ar, description, is_active)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT(code) DO UPDATE SET name_en = excluded.name_en, name_ar = excluded.name_ar
            "#,
        )
        .bind(code)
        .bind(name_en)
        .bind(name_ar)
        .bind(description)
        .execute(pool)
        .await?;
    }

    let statuses = [
        (ExecutionStatus::Pending, "Pending", "قيد الانتظار"),
        (ExecutionStatus::Running, "Running", "قيد التشغيل"),
        (ExecutionStatus::Success, "Success", "نجاح"),
        (ExecutionStatus::Failed, "Failed", "فشل"),
        (ExecutionStatus::Skipped, "Skipped", "تم التخطي"),
    ];
    for (order, (code, name_en, name_ar)) in statuses.into_iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO execution_statuses (code, name_en, name_ar, is_terminal, is_active, sort_order)
            VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT(code) DO UPDATE SET
                name_en = excluded.name_en,
                name_ar = excluded.name_ar,
                is_terminal = excluded.is_terminal,
                sort_order = excluded.sort_order
            "#,
        )
        .bind(code)
        .bind(name_en)
        .bind(name_ar)
        .bind(code.is_terminal())
        .bind(order as i32 + 1)
        .execute(pool)
        .await?;
    }

    debug!("Reference data seeded");
    Ok(())
}
