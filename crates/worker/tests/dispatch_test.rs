use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{DatabaseConfig, ExecutionContext, ExecutionLogger, LogEvent, MemorySink};
use scheduler_domain::{
    entities::{ExecutionStatus, InstanceMode, TriggerSource},
    value_objects::{
        CreateExecutionResult, IntervalSpec, JobSchedule, LockAcquisition, LockRequest,
        NewExecution, NewInstance, NewJob, NewTaskFunction,
    },
};
use scheduler_infrastructure::{DatabaseManager, Repositories};
use scheduler_worker::handlers::DataReplicationHandler;
use scheduler_worker::{
    AttemptContext, AttemptScope, DispatchJob, ExecutionStrategy, HandlerDescriptor, RetryPolicy,
    RetryingDispatcher, TaskHandler, TaskOutput, TaskRegistry, TimeLimits, WorkerPool,
};
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

/// 前 `failures` 次尝试失败，之后成功
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

fn descriptor(name: &str) -> HandlerDescriptor {
    HandlerDescriptor {
        version: 1,
        name_en: name.to_string(),
        name_ar: name.to_string(),
        description: None,
    }
}

#[async_trait]
impl TaskHandler for Flaky {
    fn key(&self) -> &'static str {
        "flaky"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Flaky")
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            bail!("transient failure on attempt {}", attempt.attempt);
        }
        Ok(TaskOutput::new(format!("ok after {call} calls")))
    }
}

/// 超过硬时限
struct Sleeper;

#[async_trait]
impl TaskHandler for Sleeper {
    fn key(&self) -> &'static str {
        "sleeper"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Sleeper")
    }

    async fn run(&self, _attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(TaskOutput::new("woke up"))
    }
}

/// 打开作用域连接池后失败，用于检查资源释放
struct PoolThenFail {
    url: String,
    opened: Arc<Mutex<Vec<SqlitePool>>>,
}

#[async_trait]
impl TaskHandler for PoolThenFail {
    fn key(&self) -> &'static str {
        "pool_then_fail"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Pool then fail")
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        let pool = attempt.scope.sqlite_pool("side-db", &self.url).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        self.opened.lock().unwrap().push(pool);
        bail!("downstream rejected the batch");
    }
}

/// 轮询软时限信号，收到后提前收尾
struct Cooperative {
    observed: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl TaskHandler for Cooperative {
    fn key(&self) -> &'static str {
        "cooperative"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Cooperative")
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        for _ in 0..25 {
            if attempt.soft_limit_reached() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reached = attempt.soft_limit_reached();
        self.observed.lock().unwrap().push(reached);
        Ok(TaskOutput::new(if reached { "stopped early" } else { "finished" }))
    }
}

/// 每次尝试前记录目标表行数，再交给数据复制处理器
struct ObservedReplication {
    target_url: String,
    wait_for_soft_limit_on_first: bool,
    fix_source_url: Option<String>,
    target_rows: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl TaskHandler for ObservedReplication {
    fn key(&self) -> &'static str {
        "observed_replication"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        descriptor("Observed replication")
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> Result<TaskOutput> {
        let target = attempt.scope.sqlite_pool("observer", &self.target_url).await?;
        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM replicated_records")
            .fetch_one(&target)
            .await?;
        self.target_rows.lock().unwrap().push(rows);

        if attempt.attempt == 1 && self.wait_for_soft_limit_on_first {
            while !attempt.soft_limit_reached() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        if attempt.attempt > 1 {
            if let Some(source_url) = &self.fix_source_url {
                let source = attempt.scope.sqlite_pool("fixer", source_url).await?;
                sqlx::query("UPDATE records SET key = 'c' WHERE key IS NULL")
                    .execute(&source)
                    .await?;
            }
        }
        DataReplicationHandler.run(attempt).await
    }
}

struct Harness {
    dir: TempDir,
    _manager: DatabaseManager,
    repos: Repositories,
    sink: MemorySink,
    logger: ExecutionLogger,
}

impl Harness {
    async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("scheduler.db").display()),
            ..DatabaseConfig::default()
        };
        let manager = DatabaseManager::connect(&config).await?;
        let repos = Repositories::sqlite(manager.pool().clone());
        let sink = MemorySink::new();
        let logger = ExecutionLogger::with_memory_sink(sink.clone());
        Ok(Self {
            dir,
            _manager: manager,
            repos,
            sink,
            logger,
        })
    }

    fn side_db_url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("side.db").display())
    }

    fn dispatcher(&self, registry: TaskRegistry, max_retries: u32) -> RetryingDispatcher {
        let policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        let limits = TimeLimits {
            soft: Duration::from_millis(100),
            hard: Duration::from_millis(300),
        };
        RetryingDispatcher::new(
            Arc::new(registry),
            self.repos.executions.clone(),
            policy,
            limits,
            self.logger.clone(),
        )
    }

    /// 源库 `records` 三行（`null_key` 时第三行 key 为空），目标库只有空表
    async fn replication_dbs(&self, null_key: bool) -> Result<(String, String)> {
        let source_url = format!("sqlite://{}", self.dir.path().join("source.db").display());
        let target_url = format!("sqlite://{}", self.dir.path().join("target.db").display());

        let scope = AttemptScope::new();
        let source = scope.sqlite_pool("setup-source", &source_url).await?;
        sqlx::query("CREATE TABLE records (key TEXT, payload TEXT)")
            .execute(&source)
            .await?;
        let third = if null_key { None } else { Some("c") };
        for (key, payload) in [(Some("a"), "1"), (Some("b"), "2"), (third, "3")] {
            sqlx::query("INSERT INTO records (key, payload) VALUES ($1, $2)")
                .bind(key)
                .bind(payload)
                .execute(&source)
                .await?;
        }
        let target = scope.sqlite_pool("setup-target", &target_url).await?;
        sqlx::query(
            "CREATE TABLE replicated_records (key TEXT PRIMARY KEY, payload TEXT, replicated_at TEXT NOT NULL)",
        )
        .execute(&target)
        .await?;
        scope.dispose_all().await;
        Ok((source_url, target_url))
    }

    /// 建作业、插入执行、加锁转为 running
    async fn running_execution(&self, task_key: &str) -> Result<DispatchJob> {
        let function = self
            .repos
            .reference_data
            .upsert_task_function(&NewTaskFunction {
                key: task_key.to_string(),
                implementation: task_key.to_string(),
                version: 1,
                name_en: task_key.to_string(),
                name_ar: task_key.to_string(),
                description: None,
            })
            .await?;
        let job = self
            .repos
            .jobs
            .create(&NewJob::new(
                format!("{task_key}-job"),
                function.id,
                JobSchedule::Interval(IntervalSpec::hours(1)),
            ))
            .await?;
        let instance = self
            .repos
            .instances
            .register(&NewInstance {
                instance_name: "node-a".to_string(),
                host_name: "localhost".to_string(),
                process_id: 1,
                mode: InstanceMode::Embedded,
            })
            .await?;

        let execution_id = Uuid::new_v4();
        let ctx = ExecutionContext::new().with("execution_id", execution_id.to_string());
        let created = self
            .repos
            .executions
            .create_if_idle(&NewExecution {
                execution_id,
                job_id: job.id,
                trigger_source: TriggerSource::Manual,
                triggered_by: None,
                parent_execution_id: None,
                correlation_id: ctx.correlation_id().to_string(),
                scheduled_at: Utc::now(),
            })
            .await?;
        assert!(matches!(created, CreateExecutionResult::Created(_)));

        let acquired = self
            .repos
            .locks
            .acquire_and_start(&LockRequest {
                job_id: job.id,
                instance_id: instance.id,
                execution_id,
                run_id: Uuid::new_v4().to_string(),
                host_name: "localhost".to_string(),
                ttl: chrono::Duration::seconds(30),
                now: Utc::now(),
            })
            .await?;
        assert!(matches!(acquired, LockAcquisition::Acquired(_)));

        Ok(DispatchJob {
            execution_id,
            job_id: job.id,
            executor_id: instance.id,
            task_key: task_key.to_string(),
            parameters: json!({}),
            context: ctx,
        })
    }
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() -> Result<()> {
    let harness = Harness::new().await?;
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(Flaky::new(1)));
    let dispatcher = harness.dispatcher(registry, 3);

    let job = harness.running_execution("flaky").await?;
    let execution_id = job.execution_id;
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.attempts, 2);
    assert!(execution.error_message.is_none());
    assert!(execution.duration_ms.is_some());
    assert!(execution.completed_at.is_some());

    let records = harness.sink.for_execution(&execution_id.to_string());
    let failed: Vec<_> = records
        .iter()
        .filter(|r| r.event == LogEvent::DispatchAttemptFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("transient failure"));
    assert_eq!(harness.sink.count(LogEvent::DispatchRetryScheduled), 1);
    assert_eq!(harness.sink.count(LogEvent::DispatchSuccess), 1);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_record_failure() -> Result<()> {
    let harness = Harness::new().await?;
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(Flaky::new(10)));
    let dispatcher = harness.dispatcher(registry, 2);

    let job = harness.running_execution("flaky").await?;
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.attempts, 3);
    assert!(execution
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("transient failure"));
    assert!(execution.error_traceback.is_some());
    assert_eq!(harness.sink.count(LogEvent::DispatchAttemptFailed), 3);
    assert_eq!(harness.sink.count(LogEvent::DispatchFailed), 1);
    Ok(())
}

#[tokio::test]
async fn test_unknown_handler_fails_without_retry() -> Result<()> {
    let harness = Harness::new().await?;
    let dispatcher = harness.dispatcher(TaskRegistry::new(), 3);

    let job = harness.running_execution("not_registered").await?;
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(harness.sink.count(LogEvent::DispatchAttemptStarted), 0);
    assert!(execution
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("no handler registered"));
    Ok(())
}

#[tokio::test]
async fn test_hard_time_limit_aborts_attempt() -> Result<()> {
    let harness = Harness::new().await?;
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(Sleeper));
    let dispatcher = harness.dispatcher(registry, 0);

    let job = harness.running_execution("sleeper").await?;
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("hard time limit"));
    assert_eq!(harness.sink.count(LogEvent::DispatchSoftLimitReached), 1);
    Ok(())
}

#[tokio::test]
async fn test_attempt_resources_are_disposed_after_each_attempt() -> Result<()> {
    let harness = Harness::new().await?;
    let opened = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(PoolThenFail {
        url: harness.side_db_url(),
        opened: Arc::clone(&opened),
    }));
    let dispatcher = harness.dispatcher(registry, 1);

    let job = harness.running_execution("pool_then_fail").await?;
    let execution = dispatcher.dispatch(job).await?;
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let pools = opened.lock().unwrap().clone();
    assert_eq!(pools.len(), 2);
    assert!(pools.iter().all(|pool| pool.is_closed()));
    assert_eq!(harness.sink.count(LogEvent::ResourcesDisposed), 2);
    Ok(())
}

#[tokio::test]
async fn test_worker_pool_strategy_runs_dispatch_on_its_own_runtime() -> Result<()> {
    let harness = Harness::new().await?;
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(Flaky::new(0)));
    let dispatcher = Arc::new(harness.dispatcher(registry, 0));

    let strategy = ExecutionStrategy::WorkerPool(WorkerPool::new(2)?);
    let job = harness.running_execution("flaky").await?;
    let execution = strategy.execute(Arc::clone(&dispatcher), job).await?;
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.attempts, 1);

    strategy.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_soft_time_limit_is_signalled_to_handler() -> Result<()> {
    let harness = Harness::new().await?;
    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(Cooperative {
        observed: Arc::clone(&observed),
    }));
    let dispatcher = harness.dispatcher(registry, 0);

    let job = harness.running_execution("cooperative").await?;
    let execution_id = job.execution_id;
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.result_summary.as_deref(), Some("stopped early"));
    assert_eq!(*observed.lock().unwrap(), vec![true]);
    let soft: Vec<_> = harness
        .sink
        .for_execution(&execution_id.to_string())
        .into_iter()
        .filter(|r| r.event == LogEvent::DispatchSoftLimitReached)
        .collect();
    assert_eq!(soft.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_replication_rolled_back_at_soft_limit_then_copied_on_retry() -> Result<()> {
    let harness = Harness::new().await?;
    let (source_url, target_url) = harness.replication_dbs(false).await?;
    let target_rows = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(ObservedReplication {
        target_url: target_url.clone(),
        wait_for_soft_limit_on_first: true,
        fix_source_url: None,
        target_rows: Arc::clone(&target_rows),
    }));
    let dispatcher = harness.dispatcher(registry, 1);

    let mut job = harness.running_execution("observed_replication").await?;
    job.parameters = json!({
        "source_url": source_url,
        "target_url": target_url,
        "query": "SELECT key, payload FROM records ORDER BY rowid",
    });
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.attempts, 2);
    assert_eq!(
        execution.result_summary.as_deref(),
        Some("replicated 3 rows into replicated_records")
    );
    // 第一次尝试在软时限处放弃，目标表保持为空
    assert_eq!(*target_rows.lock().unwrap(), vec![0, 0]);

    let failed: Vec<_> = harness
        .sink
        .records()
        .into_iter()
        .filter(|r| r.event == LogEvent::DispatchAttemptFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("soft time limit"));

    let scope = AttemptScope::new();
    let target = scope.sqlite_pool("verify", &target_url).await?;
    let keys: Vec<(String,)> = sqlx::query_as("SELECT key FROM replicated_records ORDER BY key")
        .fetch_all(&target)
        .await?;
    assert_eq!(keys, vec![("a".to_string(),), ("b".to_string(),), ("c".to_string(),)]);
    scope.dispose_all().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_replication_attempt_leaves_target_unchanged() -> Result<()> {
    let harness = Harness::new().await?;
    let (source_url, target_url) = harness.replication_dbs(true).await?;
    let target_rows = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(ObservedReplication {
        target_url: target_url.clone(),
        wait_for_soft_limit_on_first: false,
        fix_source_url: Some(source_url.clone()),
        target_rows: Arc::clone(&target_rows),
    }));
    let dispatcher = harness.dispatcher(registry, 1);

    let mut job = harness.running_execution("observed_replication").await?;
    job.parameters = json!({
        "source_url": source_url,
        "target_url": target_url,
        "query": "SELECT key, payload FROM records ORDER BY rowid",
    });
    let execution = dispatcher.dispatch(job).await?;

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.attempts, 2);
    // 第一次尝试写入两行后在空 key 上失败，事务回滚
    assert_eq!(*target_rows.lock().unwrap(), vec![0, 0]);
    assert_eq!(harness.sink.count(LogEvent::DispatchAttemptFailed), 1);

    let scope = AttemptScope::new();
    let target = scope.sqlite_pool("verify", &target_url).await?;
    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM replicated_records")
        .fetch_one(&target)
        .await?;
    assert_eq!(rows, 3);
    scope.dispose_all().await;
    Ok(())
}
