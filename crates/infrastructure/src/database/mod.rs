pub mod manager;
pub mod mapping;
pub mod migrations;
pub mod sqlite;

pub use manager::DatabaseManager;
pub use migrations::{run_migrations, seed_reference_data};
pub use sqlite::{
    SqliteExecutionRepository, SqliteInstanceRepository, SqliteJobRepository,
    SqliteLockRepository, SqliteReferenceDataRepository,
};

use std::sync::Arc;

use scheduler_domain::repositories::{
    ExecutionRepository, InstanceRepository, JobRepository, LockRepository,
    ReferenceDataRepository,
};
use sqlx::SqlitePool;

/// 共享同一连接池的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub reference_data: Arc<dyn ReferenceDataRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub instances: Arc<dyn InstanceRepository>,
}

impl Repositories {
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            reference_data: Arc::new(SqliteReferenceDataRepository::new(pool.clone())),
            jobs: Arc::new(SqliteJobRepository::new(pool.clone())),
            executions: Arc::new(SqliteExecutionRepository::new(pool.clone())),
            locks: Arc::new(SqliteLockRepository::new(pool.clone())),
            instances: Arc::new(SqliteInstanceRepository::new(pool)),
        }
    }
}
