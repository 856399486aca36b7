use std::str::FromStr;
use std::time::Duration;

use scheduler_core::config::models::DatabaseConfig;
use scheduler_errors::SchedulerResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::migrations::{run_migrations, seed_reference_data};

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 打开连接池（WAL、外键、忙等待），并执行建表与参考数据初始化
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let pool = Self::open_pool(config).await?;
        run_migrations(&pool).await?;
        seed_reference_data(&pool).await?;

        info!(url = %config.url, "数据库连接池就绪");
        Ok(Self { pool })
    }

    pub async fn open_pool(config: &DatabaseConfig) -> SchedulerResult<SqlitePool> {
        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(connect_options)
            .await?;

        Ok(pool)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
