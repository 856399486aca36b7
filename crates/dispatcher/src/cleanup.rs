use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use scheduler_core::{CleanupConfig, ExecutionContext, ExecutionLogger, HeartbeatConfig, LogEvent};
use scheduler_domain::{
    repositories::{ExecutionRepository, InstanceRepository, LockRepository},
    value_objects::CleanupReport,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

/// 数据清理服务
///
/// 只按确定性谓词删除，可重复执行，多个实例并发运行也安全。
#[derive(Clone)]
pub struct CleanupService {
    executions: Arc<dyn ExecutionRepository>,
    locks: Arc<dyn LockRepository>,
    instances: Arc<dyn InstanceRepository>,
    heartbeat: HeartbeatConfig,
    logger: ExecutionLogger,
}

impl CleanupService {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        locks: Arc<dyn LockRepository>,
        instances: Arc<dyn InstanceRepository>,
        heartbeat: HeartbeatConfig,
        logger: ExecutionLogger,
    ) -> Self {
        Self {
            executions,
            locks,
            instances,
            heartbeat,
            logger,
        }
    }

    /// 回收失联执行后删除：超期终态执行、已放弃的锁、长期失联的实例
    pub async fn run_once(&self, retention_days: i64) -> SchedulerResult<CleanupReport> {
        if retention_days < 0 {
            return Err(SchedulerError::validation_error(
                "retention_days must not be negative",
            ));
        }

        let now = Utc::now();
        let ctx = ExecutionContext::new().with("retention_days", retention_days);

        let reaped = self
            .executions
            .reap_abandoned(None, now, self.heartbeat.staleness())
            .await?;
        if reaped > 0 {
            self.logger.warn(
                &ctx,
                LogEvent::ExecutionReaped,
                format!("reaped {reaped} abandoned execution(s)"),
                None,
            );
        }

        let report = CleanupReport {
            deleted_executions: self
                .executions
                .delete_terminal_before(now - Duration::days(retention_days))
                .await?,
            deleted_locks: self
                .locks
                .delete_abandoned(now, now - self.heartbeat.staleness())
                .await?,
            deleted_instances: self
                .instances
                .delete_stale(now - self.heartbeat.instance_retention())
                .await?,
        };

        self.logger.info(
            &ctx.child([
                ("deleted_executions", json!(report.deleted_executions)),
                ("deleted_locks", json!(report.deleted_locks)),
                ("deleted_instances", json!(report.deleted_instances)),
            ]),
            LogEvent::CleanupCompleted,
            format!("cleanup removed {} row(s)", report.total()),
        );
        Ok(report)
    }

    /// 按配置周期运行清理
    pub fn start(&self, config: CleanupConfig, mut shutdown_rx: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if !config.enabled {
            info!("自动清理已禁用");
            return None;
        }

        let service = self.clone();
        Some(tokio::spawn(async move {
            let mut cleanup_interval = interval(StdDuration::from_secs(config.interval_seconds));
            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        if let Err(e) = service.run_once(config.retention_days).await {
                            error!("定期清理失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("清理任务退出");
                        break;
                    }
                }
            }
        }))
    }
}
