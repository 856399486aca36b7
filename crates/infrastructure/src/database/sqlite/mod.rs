pub mod sqlite_execution_repository;
pub mod sqlite_instance_repository;
pub mod sqlite_job_repository;
pub mod sqlite_lock_repository;
pub mod sqlite_reference_data_repository;

pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_instance_repository::SqliteInstanceRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_lock_repository::SqliteLockRepository;
pub use sqlite_reference_data_repository::SqliteReferenceDataRepository;

use scheduler_errors::SchedulerError;
use sqlx::{Sqlite, Transaction};
use tracing::warn;

/// 部分唯一索引冲突视为作业已有非终态执行
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub(crate) fn rows_or_not_found(
    rows_affected: u64,
    not_found: impl FnOnce() -> SchedulerError,
) -> Result<(), SchedulerError> {
    if rows_affected == 0 {
        Err(not_found())
    } else {
        Ok(())
    }
}

/// 事务内操作失败：先显式回滚，再返回原始错误
pub(crate) async fn rollback(tx: Transaction<'_, Sqlite>, err: SchedulerError) -> SchedulerError {
    if let Err(rollback_err) = tx.rollback().await {
        warn!("事务回滚失败: {}", rollback_err);
    }
    err
}
