mod common;

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use common::{interval_job, TestCluster};
use scheduler_core::LogEvent;
use scheduler_domain::{
    entities::{ExecutionStatus, InstanceMode, InstanceStatus, TriggerSource},
    value_objects::{
        CreateExecutionResult, ExecutionFilter, IntervalSpec, LockAcquisition, LockRequest,
        NewExecution, NewInstance, Pagination,
    },
};
use uuid::Uuid;

#[tokio::test]
async fn test_second_trigger_is_rejected_while_first_runs() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();
    let job = interval_job(&node, "J", "gate", IntervalSpec::seconds(60)).await?;

    let first = service.trigger_now(job.id, Some(7)).await?;
    let second = service.trigger_now(job.id, Some(8)).await;

    let err = second.unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("already running"));
    assert_eq!(cluster.sink.count(LogEvent::DuplicateCheckRejected), 1);

    cluster.gate.open();
    node.wait_idle().await;

    let execution = service.get_execution(first).await?;
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.trigger_source, TriggerSource::Manual);
    assert_eq!(execution.triggered_by, Some(7));
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());
    assert_eq!(execution.executor_id, Some(node.instance_id()));
    assert!(node.repositories().locks.get(job.id).await?.is_none());

    let lifecycle: Vec<LogEvent> = cluster
        .sink
        .for_execution(&first.to_string())
        .into_iter()
        .map(|record| record.event)
        .collect();
    for expected in [
        LogEvent::ExecutionCreated,
        LogEvent::LockAcquired,
        LogEvent::DispatchStarted,
        LogEvent::DispatchSuccess,
    ] {
        assert!(lifecycle.contains(&expected), "missing {expected:?}");
    }

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_triggers_across_instances_yield_one_execution() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node_a = cluster.node("node-a").await?;
    let node_b = cluster.node("node-b").await?;
    let job = interval_job(&node_a, "shared", "gate", IntervalSpec::seconds(60)).await?;

    let job_id = job.id;
    let mut handles = Vec::new();
    for i in 0..8 {
        let service = if i % 2 == 0 {
            node_a.service()
        } else {
            node_b.service()
        };
        handles.push(tokio::spawn(async move {
            service.trigger_now(job_id, None).await
        }));
    }

    let mut accepted = Vec::new();
    for handle in handles {
        match handle.await? {
            Ok(execution_id) => accepted.push(execution_id),
            Err(e) => assert!(e.is_validation(), "unexpected error: {e}"),
        }
    }
    assert_eq!(accepted.len(), 1);

    cluster.gate.open();
    node_a.wait_idle().await;
    node_b.wait_idle().await;

    let history = node_a
        .service()
        .get_history(Some(job.id), ExecutionFilter::default(), Pagination::default())
        .await?;
    assert_eq!(history.total, 1);
    assert_eq!(history.items[0].execution_id, accepted[0]);
    assert_eq!(history.items[0].status, ExecutionStatus::Success);

    node_a.shutdown().await?;
    node_b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_disabled_job_never_produces_execution() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();
    let job = interval_job(&node, "disabled", "noop", IntervalSpec::hours(1)).await?;

    service.disable_job(job.id, None).await?;
    let err = service.trigger_now(job.id, None).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(cluster.sink.count(LogEvent::TriggerRejected), 1);

    let history = service
        .get_history(Some(job.id), ExecutionFilter::default(), Pagination::default())
        .await?;
    assert_eq!(history.total, 0);

    // 暂停只影响定时器，手动触发仍可执行
    service.enable_job(job.id, None).await?;
    service.pause_job(job.id, None).await?;
    let execution_id = service.trigger_now(job.id, None).await?;
    node.wait_idle().await;
    assert_eq!(
        service.get_execution(execution_id).await?.status,
        ExecutionStatus::Success
    );

    assert!(service.trigger_now(9999, None).await.unwrap_err().is_not_found());
    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_transient_dispatch_failure_succeeds_on_retry() -> Result<()> {
    let cluster = TestCluster::new()?;
    let mut config = cluster.config();
    config.dispatch.max_retries = 3;
    config.dispatch.base_delay_ms = 1000;
    config.dispatch.max_delay_ms = 2000;
    let node = cluster.node_with("node-a", config).await?;
    let service = node.service();
    let job = interval_job(&node, "flaky", "fails_once", IntervalSpec::seconds(60)).await?;

    let execution_id = service.trigger_now(job.id, None).await?;
    node.wait_idle().await;

    let execution = service.get_execution(execution_id).await?;
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.attempts, 2);
    assert!(execution.error_message.is_none());
    assert_eq!(execution.result_summary.as_deref(), Some("recovered"));
    // 只计成功那一次的耗时，不含退避等待
    assert!(execution.duration_ms.unwrap_or(i64::MAX) < 1000);

    let failures: Vec<_> = cluster
        .sink
        .for_execution(&execution_id.to_string())
        .into_iter()
        .filter(|record| record.event == LogEvent::DispatchAttemptFailed)
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("connection reset"));

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_stale_lock_does_not_block_new_trigger() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let repos = node.repositories().clone();
    let service = node.service();
    let job = interval_job(&node, "healing", "noop", IntervalSpec::seconds(60)).await?;

    // 已崩溃的实例：心跳早已陈旧，锁的TTL也已过期
    let long_ago = Utc::now() - chrono::Duration::minutes(30);
    let crashed = repos
        .instances
        .register(&NewInstance {
            instance_name: "crashed".to_string(),
            host_name: "old-host".to_string(),
            process_id: 4242,
            mode: InstanceMode::Standalone,
        })
        .await?;
    repos.instances.heartbeat(crashed.id, long_ago).await?;

    let orphan_id = Uuid::new_v4();
    let created = repos
        .executions
        .create_if_idle(&NewExecution {
            execution_id: orphan_id,
            job_id: job.id,
            trigger_source: TriggerSource::Scheduled,
            triggered_by: None,
            parent_execution_id: None,
            correlation_id: "orphan".to_string(),
            scheduled_at: long_ago,
        })
        .await?;
    assert!(matches!(created, CreateExecutionResult::Created(_)));
    let acquired = repos
        .locks
        .acquire_and_start(&LockRequest {
            job_id: job.id,
            instance_id: crashed.id,
            execution_id: orphan_id,
            run_id: "orphan-run".to_string(),
            host_name: "old-host".to_string(),
            ttl: chrono::Duration::seconds(30),
            now: long_ago,
        })
        .await?;
    assert!(matches!(acquired, LockAcquisition::Acquired(_)));

    let execution_id = service.trigger_now(job.id, None).await?;
    node.wait_idle().await;

    assert_eq!(
        service.get_execution(execution_id).await?.status,
        ExecutionStatus::Success
    );
    let orphan = service.get_execution(orphan_id).await?;
    assert_eq!(orphan.status, ExecutionStatus::Failed);
    assert!(orphan
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("abandoned"));
    assert_eq!(cluster.sink.count(LogEvent::ExecutionReaped), 1);

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_retry_execution_records_lineage() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();
    let job = interval_job(&node, "lineage", "gate", IntervalSpec::seconds(60)).await?;

    let first = service.trigger_now(job.id, None).await?;
    // 运行中的执行不能重跑
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service
        .retry_execution(first, None)
        .await
        .unwrap_err()
        .is_validation());

    cluster.gate.open();
    node.wait_idle().await;

    let retry = service.retry_execution(first, Some(3)).await?;
    node.wait_idle().await;

    let execution = service.get_execution(retry).await?;
    assert_eq!(execution.parent_execution_id, Some(first));
    assert_eq!(execution.trigger_source, TriggerSource::Manual);
    assert_eq!(execution.status, ExecutionStatus::Success);

    assert!(service
        .retry_execution(Uuid::new_v4(), None)
        .await
        .unwrap_err()
        .is_not_found());
    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_marks_instance_stopped() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let instance_id = node.instance_id();

    node.shutdown().await?;

    let watcher = cluster.node("watcher").await?;
    let instance = watcher
        .repositories()
        .instances
        .get(instance_id)
        .await?
        .expect("instance row kept after shutdown");
    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert!(instance.stopped_at.is_some());
    watcher.shutdown().await?;
    Ok(())
}
