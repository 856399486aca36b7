use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scheduler_core::{ExecutionContext, ExecutionLogger, HeartbeatConfig, LogEvent};
use scheduler_domain::{
    entities::{InstanceMode, InstanceStatus, SchedulerInstance},
    repositories::InstanceRepository,
    value_objects::NewInstance,
};
use scheduler_errors::SchedulerResult;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::lock_manager::LockManager;

pub fn current_host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// 当前进程在实例表中的登记与心跳
pub struct InstanceRegistry {
    instances: Arc<dyn InstanceRepository>,
    instance: SchedulerInstance,
    config: HeartbeatConfig,
    logger: ExecutionLogger,
}

impl InstanceRegistry {
    /// 启动时登记实例并置为 running
    pub async fn register(
        instances: Arc<dyn InstanceRepository>,
        mode: InstanceMode,
        instance_name: Option<String>,
        config: HeartbeatConfig,
        logger: ExecutionLogger,
    ) -> SchedulerResult<Self> {
        let host_name = current_host_name();
        let process_id = i64::from(std::process::id());
        let instance_name =
            instance_name.unwrap_or_else(|| format!("{host_name}-{process_id}"));

        let mut instance = instances
            .register(&NewInstance {
                instance_name,
                host_name,
                process_id,
                mode,
            })
            .await?;
        instances.set_status(instance.id, InstanceStatus::Running).await?;
        instance.status = InstanceStatus::Running;

        logger.info(
            &Self::context_for(&instance),
            LogEvent::InstanceRegistered,
            format!(
                "{} instance {} registered on {}",
                instance.mode.as_str(),
                instance.instance_name,
                instance.host_name
            ),
        );

        Ok(Self {
            instances,
            instance,
            config,
            logger,
        })
    }

    fn context_for(instance: &SchedulerInstance) -> ExecutionContext {
        ExecutionContext::new()
            .with("instance_id", instance.id)
            .with("instance_name", json!(instance.instance_name))
    }

    pub fn id(&self) -> i64 {
        self.instance.id
    }

    pub fn host_name(&self) -> &str {
        &self.instance.host_name
    }

    pub fn instance(&self) -> &SchedulerInstance {
        &self.instance
    }

    /// 周期刷新 `last_heartbeat`，收到关闭信号后退出
    pub fn start_heartbeat_task(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let instances = Arc::clone(&self.instances);
        let logger = self.logger.clone();
        let instance_id = self.instance.id;
        let ctx = Self::context_for(&self.instance);
        let period = Duration::from_secs(self.config.interval_seconds);

        tokio::spawn(async move {
            let mut heartbeat_interval = interval(period);
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        match instances.heartbeat(instance_id, Utc::now()).await {
                            Ok(()) => debug!(instance_id, "心跳已刷新"),
                            Err(e) => logger.warn(
                                &ctx,
                                LogEvent::HeartbeatFailed,
                                "failed to refresh heartbeat",
                                Some(&e.to_string()),
                            ),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(instance_id, "心跳任务退出");
                        break;
                    }
                }
            }
        })
    }

    /// 释放本实例持有的锁并标记为 stopped
    pub async fn stop(&self, locks: &LockManager) -> SchedulerResult<()> {
        self.instances
            .set_status(self.instance.id, InstanceStatus::Stopping)
            .await?;
        let released = locks.release_all().await?;
        self.instances
            .mark_stopped(self.instance.id, Utc::now())
            .await?;

        self.logger.info(
            &Self::context_for(&self.instance),
            LogEvent::InstanceStopped,
            format!("instance stopped, released {released} lock(s)"),
        );
        Ok(())
    }
}
