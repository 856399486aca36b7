use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use scheduler_domain::repositories::ExecutionRepository;

use crate::handler::{AttemptContext, HandlerDescriptor, TaskHandler, TaskOutput};

const DEFAULT_RETENTION_DAYS: u64 = 30;

/// 按保留天数删除终态执行历史
pub struct HistoryCleanupHandler {
    executions: Arc<dyn ExecutionRepository>,
}

impl HistoryCleanupHandler {
    pub fn new(executions: Arc<dyn ExecutionRepository>) -> Self {
        Self { executions }
    }
}

#[async_trait]
impl TaskHandler for HistoryCleanupHandler {
    fn key(&self) -> &'static str {
        "history_cleanup"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            version: 1,
            name_en: "Execution history cleanup".to_string(),
            name_ar: "تنظيف سجل التنفيذ".to_string(),
            description: Some("Deletes terminal executions older than retention_days".to_string()),
        }
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> anyhow::Result<TaskOutput> {
        let retention_days = attempt
            .param_u64("retention_days")
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        let days = i64::try_from(retention_days).context("retention_days 超出范围")?;
        let cutoff = Utc::now() - Duration::days(days);

        let deleted = self
            .executions
            .delete_terminal_before(cutoff)
            .await
            .context("删除执行历史失败")?;

        Ok(TaskOutput::new(format!(
            "deleted {deleted} executions older than {retention_days} days"
        )))
    }
}
