//! 调度节点装配
//!
//! 一个节点 = 一个实例登记 + 心跳 + 触发评估器 + 可选的定期清理，
//! 共用同一连接池与同一个调度服务。

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{AppConfig, ExecutionLogger};
use scheduler_domain::entities::InstanceMode;
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::{DatabaseManager, Repositories};
use scheduler_worker::{
    ExecutionStrategy, RetryPolicy, RetryingDispatcher, TaskHandler, TaskRegistry, TimeLimits,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cleanup::CleanupService;
use crate::instance_registry::InstanceRegistry;
use crate::launcher::Launcher;
use crate::lock_manager::LockManager;
use crate::scheduler_service::SchedulerService;
use crate::trigger_evaluator::{job_set_channel, TriggerEvaluator};

pub struct SchedulerNodeBuilder {
    config: AppConfig,
    mode: InstanceMode,
    logger: ExecutionLogger,
    handlers: Vec<Arc<dyn TaskHandler>>,
    start_timers: bool,
}

impl SchedulerNodeBuilder {
    pub fn new(config: AppConfig) -> Self {
        let mode = if config.scheduler.mode == "embedded" {
            InstanceMode::Embedded
        } else {
            InstanceMode::Standalone
        };
        Self {
            config,
            mode,
            logger: ExecutionLogger::new(),
            handlers: Vec::new(),
            start_timers: true,
        }
    }

    pub fn mode(mut self, mode: InstanceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn logger(mut self, logger: ExecutionLogger) -> Self {
        self.logger = logger;
        self
    }

    /// 在内置处理器之外注册处理器
    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// 不启动触发评估器和定期清理，只提供服务接口
    pub fn without_timers(mut self) -> Self {
        self.start_timers = false;
        self
    }

    pub async fn start(self) -> SchedulerResult<SchedulerNode> {
        let config = self.config;
        let logger = self.logger;

        let database = DatabaseManager::connect(&config.database).await?;
        let repos = Repositories::sqlite(database.pool().clone());

        let mut registry = TaskRegistry::with_builtins(repos.executions.clone());
        for handler in self.handlers {
            registry.register(handler);
        }
        for function in registry.task_functions() {
            repos.reference_data.upsert_task_function(&function).await?;
        }
        let registry = Arc::new(registry);

        let instance = InstanceRegistry::register(
            repos.instances.clone(),
            self.mode,
            config.scheduler.instance_name.clone(),
            config.heartbeat.clone(),
            logger.clone(),
        )
        .await?;

        let locks = LockManager::new(
            repos.locks.clone(),
            config.lock.clone(),
            instance.id(),
            instance.host_name(),
            logger.clone(),
        );
        let dispatcher = Arc::new(RetryingDispatcher::new(
            Arc::clone(&registry),
            repos.executions.clone(),
            RetryPolicy::from(&config.dispatch),
            TimeLimits::from(&config.dispatch),
            logger.clone(),
        ));
        let strategy = Arc::new(ExecutionStrategy::from_config(&config.dispatch)?);
        let launcher = Arc::new(Launcher::new(
            repos.jobs.clone(),
            repos.executions.clone(),
            locks.clone(),
            dispatcher,
            Arc::clone(&strategy),
            logger.clone(),
        ));
        let cleanup = CleanupService::new(
            repos.executions.clone(),
            repos.locks.clone(),
            repos.instances.clone(),
            config.heartbeat.clone(),
            logger.clone(),
        );

        let (job_set_tx, job_set_rx) = job_set_channel();
        let service = Arc::new(
            SchedulerService::new(
                repos.clone(),
                registry,
                Arc::clone(&launcher),
                cleanup.clone(),
                config.heartbeat.clone(),
                logger.clone(),
            )
            .with_job_set_listener(job_set_tx),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = vec![instance.start_heartbeat_task(shutdown_tx.subscribe())];
        if self.start_timers {
            let evaluator = TriggerEvaluator::new(
                Arc::clone(&service),
                repos.jobs.clone(),
                job_set_rx,
                config.scheduler.clone(),
                logger.clone(),
            );
            tasks.push(tokio::spawn(evaluator.run(shutdown_tx.subscribe())));
            if let Some(handle) = cleanup.start(config.cleanup.clone(), shutdown_tx.subscribe()) {
                tasks.push(handle);
            }
        }

        info!(
            instance_id = instance.id(),
            strategy = strategy.name(),
            "调度节点已启动"
        );

        Ok(SchedulerNode {
            database,
            repos,
            service,
            launcher,
            locks,
            instance,
            strategy,
            shutdown_tx,
            tasks,
            shutdown_grace: Duration::from_secs(config.scheduler.shutdown_grace_seconds),
        })
    }
}

pub struct SchedulerNode {
    database: DatabaseManager,
    repos: Repositories,
    service: Arc<SchedulerService>,
    launcher: Arc<Launcher>,
    locks: LockManager,
    instance: InstanceRegistry,
    strategy: Arc<ExecutionStrategy>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl SchedulerNode {
    pub fn builder(config: AppConfig) -> SchedulerNodeBuilder {
        SchedulerNodeBuilder::new(config)
    }

    pub fn service(&self) -> Arc<SchedulerService> {
        Arc::clone(&self.service)
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn instance_id(&self) -> i64 {
        self.instance.id()
    }

    /// 等待所有已启动的后台执行结束
    pub async fn wait_idle(&self) {
        self.launcher.wait_idle().await;
    }

    /// 停止定时器、等待在途执行、释放锁并把实例标记为 stopped
    pub async fn shutdown(self) -> SchedulerResult<()> {
        info!(instance_id = self.instance.id(), "调度节点正在关闭");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("后台循环异常退出: {}", e);
            }
        }

        self.launcher.drain(self.shutdown_grace).await;

        let strategy = Arc::clone(&self.strategy);
        tokio::task::spawn_blocking(move || strategy.shutdown())
            .await
            .map_err(|e| SchedulerError::Internal(format!("关闭执行线程池失败: {e}")))?;

        self.instance.stop(&self.locks).await?;
        self.database.close().await;
        info!("调度节点已关闭");
        Ok(())
    }
}
