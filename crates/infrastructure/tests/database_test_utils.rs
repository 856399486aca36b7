use anyhow::Result;
use scheduler_core::config::models::DatabaseConfig;
use scheduler_domain::{
    entities::TaskFunction,
    value_objects::{JobSchedule, NewJob, NewTaskFunction},
};
use scheduler_infrastructure::{DatabaseManager, Repositories};
use tempfile::TempDir;

/// 基于临时文件的 SQLite 测试库
pub struct TestDatabase {
    _dir: TempDir,
    pub manager: DatabaseManager,
    pub repos: Repositories,
    pub database_url: String,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let database_url = format!("sqlite://{}", dir.path().join("scheduler.db").display());
        let config = DatabaseConfig {
            url: database_url.clone(),
            max_connections: 5,
            ..DatabaseConfig::default()
        };
        let manager = DatabaseManager::connect(&config).await?;
        let repos = Repositories::sqlite(manager.pool().clone());

        Ok(Self {
            _dir: dir,
            manager,
            repos,
            database_url,
        })
    }

    pub async fn task_function(&self, key: &str) -> Result<TaskFunction> {
        Ok(self
            .repos
            .reference_data
            .upsert_task_function(&NewTaskFunction {
                key: key.to_string(),
                implementation: key.to_string(),
                version: 1,
                name_en: format!("{key} task"),
                name_ar: format!("مهمة {key}"),
                description: None,
            })
            .await?)
    }

    pub async fn job(&self, name: &str, schedule: JobSchedule) -> Result<i64> {
        let function = self.task_function("noop").await?;
        let job = self
            .repos
            .jobs
            .create(&NewJob::new(name, function.id, schedule))
            .await?;
        Ok(job.id)
    }
}
