#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use scheduler_core::{AppConfig, ExecutionLogger, MemorySink};
use scheduler_dispatcher::SchedulerNode;
use scheduler_domain::{
    entities::ScheduledJob,
    value_objects::{IntervalSpec, JobSchedule, NewJob},
};
use scheduler_worker::{AttemptContext, HandlerDescriptor, TaskHandler, TaskOutput};
use tempfile::TempDir;
use tokio::sync::Semaphore;

fn descriptor(name: &str) -> HandlerDescriptor {
    HandlerDescriptor {
        version: 1,
        name_en: name.to_string(),
        name_ar: name.to_string(),
        description: None,
    }
}

/// 直接成功
pub struct Noop;

#[async_trait]
impl TaskHandler for Noop {
    fn key(&self) -> &'static str {
        "noop"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("No-op")
    }

    async fn run(&self, _attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        Ok(TaskOutput::new("nothing to do"))
    }
}

/// 阻塞到测试放行为止，用于让执行停留在 running
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn open(&self) {
        self.permits.add_permits(1000);
    }
}

#[async_trait]
impl TaskHandler for Gate {
    fn key(&self) -> &'static str {
        "gate"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Gate")
    }

    async fn run(&self, _attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        let _permit = self.permits.acquire().await?;
        Ok(TaskOutput::new("gate opened"))
    }
}

/// 第一次尝试失败
pub struct FailsOnce {
    calls: AtomicU32,
}

impl FailsOnce {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskHandler for FailsOnce {
    fn key(&self) -> &'static str {
        "fails_once"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Fails once")
    }

    async fn run(&self, _attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            bail!("connection reset by peer");
        }
        Ok(TaskOutput::new("recovered"))
    }
}

/// 指向临时库的配置，重试间隔缩短
pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}", dir.path().join("scheduler.db").display());
    config.database.max_connections = 5;
    config.dispatch.base_delay_ms = 10;
    config.dispatch.max_delay_ms = 50;
    config.dispatch.jitter_factor = 0.0;
    config.scheduler.shutdown_grace_seconds = 5;
    config
}

pub struct TestCluster {
    pub dir: TempDir,
    pub sink: MemorySink,
    pub gate: Gate,
}

impl TestCluster {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            sink: MemorySink::new(),
            gate: Gate::new(),
        })
    }

    pub fn config(&self) -> AppConfig {
        test_config(&self.dir)
    }

    /// 共享同一数据库文件的新节点
    pub async fn node(&self, name: &str) -> Result<SchedulerNode> {
        self.node_with(name, self.config()).await
    }

    pub async fn node_with(&self, name: &str, mut config: AppConfig) -> Result<SchedulerNode> {
        config.scheduler.instance_name = Some(name.to_string());
        Ok(SchedulerNode::builder(config)
            .logger(ExecutionLogger::with_memory_sink(self.sink.clone()))
            .handler(Arc::new(Noop))
            .handler(Arc::new(self.gate.clone()))
            .handler(Arc::new(FailsOnce::new()))
            .without_timers()
            .start()
            .await?)
    }
}

/// 以处理器键创建间隔作业
pub async fn interval_job(
    node: &SchedulerNode,
    name: &str,
    task_key: &str,
    spec: IntervalSpec,
) -> Result<ScheduledJob> {
    let function = node
        .repositories()
        .reference_data
        .get_task_function_by_key(task_key)
        .await?;
    let Some(function) = function else {
        bail!("task function {task_key} was not seeded");
    };
    Ok(node
        .service()
        .create_job(NewJob::new(name, function.id, JobSchedule::Interval(spec)))
        .await?)
}
