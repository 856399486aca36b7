mod common;

use anyhow::Result;
use chrono::{Duration, Utc};
use common::{interval_job, TestCluster};
use scheduler_core::{ExecutionLogger, LogEvent};
use scheduler_dispatcher::{job_set_channel, JobSetChange, TriggerEvaluator};
use scheduler_domain::{
    entities::{ExecutionStatus, InstanceMode, JobKind, TriggerSource},
    value_objects::{
        CleanupReport, CreateExecutionResult, ExecutionFilter, IntervalSpec, JobFilter, JobPatch,
        JobSchedule, LockRequest, NewExecution, NewInstance, NewJob, Pagination,
    },
};
use uuid::Uuid;

fn cron(expression: &str) -> JobSchedule {
    JobSchedule::Cron {
        expression: expression.to_string(),
    }
}

#[tokio::test]
async fn test_create_job_validation() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();
    let noop = node
        .repositories()
        .reference_data
        .get_task_function_by_key("noop")
        .await?
        .map(|function| function.id)
        .unwrap_or_default();

    let mut mismatched = NewJob::new("mismatch", noop, JobSchedule::Interval(IntervalSpec::hours(1)));
    mismatched.job_type = JobKind::Cron;
    assert!(service.create_job(mismatched).await.unwrap_err().is_validation());

    let bad_cron = NewJob::new("bad cron", noop, cron("every tuesday"));
    assert!(service.create_job(bad_cron).await.unwrap_err().is_validation());

    let zero = NewJob::new("zero", noop, JobSchedule::Interval(IntervalSpec::default()));
    assert!(service.create_job(zero).await.unwrap_err().is_validation());

    let mut crowded = NewJob::new("crowded", noop, JobSchedule::Interval(IntervalSpec::hours(1)));
    crowded.max_instances = 11;
    assert!(service.create_job(crowded).await.unwrap_err().is_validation());

    let unnamed = NewJob::new("  ", noop, JobSchedule::Interval(IntervalSpec::hours(1)));
    assert!(service.create_job(unnamed).await.unwrap_err().is_validation());

    let orphan = NewJob::new("orphan", 9999, JobSchedule::Interval(IntervalSpec::hours(1)));
    assert!(service.create_job(orphan).await.unwrap_err().is_not_found());

    let jobs = service
        .list_jobs(&JobFilter::default(), Pagination::default())
        .await?;
    assert_eq!(jobs.total, 0);

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_job_round_trip_and_updates() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();

    let job = interval_job(&node, "every four hours", "noop", IntervalSpec::hours(4)).await?;
    let stored = service.get_job(job.id).await?;
    assert_eq!(stored.job_type, JobKind::Interval);
    assert_eq!(stored.schedule.interval().map(|spec| spec.hours), Some(4));
    assert!(stored.schedule.cron_expression().is_none());
    assert_eq!(stored.task_function_key, "noop");

    // 只改调度参数，作业类型随之切换
    let updated = service
        .update_job(
            job.id,
            JobPatch {
                schedule: Some(cron("0 */5 * * * *")),
                description: Some("five minutes".to_string()),
                ..JobPatch::default()
            },
            Some(42),
        )
        .await?;
    assert_eq!(updated.job_type, JobKind::Cron);
    assert_eq!(updated.schedule.cron_expression(), Some("0 */5 * * * *"));
    assert!(updated.schedule.interval().is_none());
    assert_eq!(updated.updated_by, Some(42));
    assert_eq!(updated.description.as_deref(), Some("five minutes"));

    let unchanged = service.update_job(job.id, JobPatch::default(), None).await?;
    assert_eq!(unchanged.schedule, updated.schedule);

    let rejected = service
        .update_job(
            job.id,
            JobPatch {
                max_instances: Some(0),
                ..JobPatch::default()
            },
            None,
        )
        .await;
    assert!(rejected.unwrap_err().is_validation());

    interval_job(&node, "other", "noop", IntervalSpec::seconds(30)).await?;
    let cron_jobs = service
        .list_jobs(
            &JobFilter {
                job_type: Some(JobKind::Cron),
                ..JobFilter::default()
            },
            Pagination::default(),
        )
        .await?;
    assert_eq!(cron_jobs.total, 1);
    assert_eq!(cron_jobs.items[0].id, job.id);

    service.delete_job(job.id, Some(42)).await?;
    assert!(service.get_job(job.id).await.unwrap_err().is_not_found());
    assert!(service.delete_job(job.id, None).await.unwrap_err().is_not_found());
    assert!(service
        .update_job(
            job.id,
            JobPatch {
                name: Some("ghost".to_string()),
                ..JobPatch::default()
            },
            None,
        )
        .await
        .unwrap_err()
        .is_not_found());
    assert!(service.trigger_now(job.id, None).await.unwrap_err().is_not_found());

    let remaining = service
        .list_jobs(&JobFilter::default(), Pagination::default())
        .await?;
    assert_eq!(remaining.total, 1);

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cleanup_is_idempotent() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();
    let repos = node.repositories().clone();

    let old = interval_job(&node, "old", "noop", IntervalSpec::hours(1)).await?;
    let execution_id = service.trigger_now(old.id, None).await?;
    node.wait_idle().await;
    sqlx::query("UPDATE job_executions SET completed_at = $1 WHERE execution_id = $2")
        .bind(Utc::now() - Duration::days(40))
        .bind(execution_id.to_string())
        .execute(node.database().pool())
        .await?;

    let fresh = service.trigger_now(old.id, None).await?;
    node.wait_idle().await;

    // 一个早已失联的实例，留下一把过期锁
    let long_ago = Utc::now() - Duration::days(2);
    let crashed = repos
        .instances
        .register(&NewInstance {
            instance_name: "crashed".to_string(),
            host_name: "old-host".to_string(),
            process_id: 1,
            mode: InstanceMode::Embedded,
        })
        .await?;
    repos.instances.heartbeat(crashed.id, long_ago).await?;
    let stuck = interval_job(&node, "stuck", "noop", IntervalSpec::hours(1)).await?;
    let orphan_id = Uuid::new_v4();
    let created = repos
        .executions
        .create_if_idle(&NewExecution {
            execution_id: orphan_id,
            job_id: stuck.id,
            trigger_source: TriggerSource::Scheduled,
            triggered_by: None,
            parent_execution_id: None,
            correlation_id: "stuck".to_string(),
            scheduled_at: long_ago,
        })
        .await?;
    assert!(matches!(created, CreateExecutionResult::Created(_)));
    repos
        .locks
        .acquire_and_start(&LockRequest {
            job_id: stuck.id,
            instance_id: crashed.id,
            execution_id: orphan_id,
            run_id: "stuck-run".to_string(),
            host_name: "old-host".to_string(),
            ttl: Duration::seconds(30),
            now: long_ago,
        })
        .await?;

    assert!(service.cleanup(-1).await.unwrap_err().is_validation());

    let first = service.cleanup(30).await?;
    assert_eq!(
        first,
        CleanupReport {
            deleted_executions: 1,
            deleted_locks: 1,
            deleted_instances: 1,
        }
    );
    assert_eq!(cluster.sink.count(LogEvent::ExecutionReaped), 1);

    let second = service.cleanup(30).await?;
    assert_eq!(second, CleanupReport::default());

    // 未超期的执行与被回收的执行都保留
    assert!(service.get_execution(execution_id).await.unwrap_err().is_not_found());
    assert_eq!(
        service.get_execution(fresh).await?.status,
        ExecutionStatus::Success
    );
    assert_eq!(
        service.get_execution(orphan_id).await?.status,
        ExecutionStatus::Failed
    );
    assert!(repos.instances.get(node.instance_id()).await?.is_some());

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_status_and_reference_data() -> Result<()> {
    let cluster = TestCluster::new()?;
    let node = cluster.node("node-a").await?;
    let service = node.service();

    let hourly = interval_job(&node, "hourly", "noop", IntervalSpec::hours(1)).await?;
    let daily = interval_job(&node, "daily", "noop", IntervalSpec::hours(24)).await?;
    service.disable_job(daily.id, None).await?;
    let execution_id = service.trigger_now(hourly.id, None).await?;
    node.wait_idle().await;

    let status = service.status().await?;
    assert_eq!(status.counts.total_jobs, 2);
    assert_eq!(status.counts.enabled_jobs, 1);
    assert_eq!(status.counts.disabled_jobs, 1);
    assert!(status
        .live_instances
        .iter()
        .any(|instance| instance.id == node.instance_id()));
    let next_run = status.next_run.expect("hourly job has a next run");
    assert_eq!(next_run.job_id, hourly.id);
    assert!(next_run.next_run_at > Utc::now());
    assert_eq!(status.recent_executions[0].execution_id, execution_id);

    assert_eq!(service.job_types().await?.len(), 2);
    let statuses: Vec<ExecutionStatus> = service
        .execution_statuses()
        .await?
        .into_iter()
        .map(|status| status.code)
        .collect();
    assert_eq!(statuses.len(), 5);
    assert!(statuses.contains(&ExecutionStatus::Skipped));

    let keys: Vec<String> = service
        .task_functions()
        .await?
        .into_iter()
        .map(|function| function.key)
        .collect();
    for key in ["history_cleanup", "data_replication", "http_request", "noop"] {
        assert!(keys.iter().any(|k| k == key), "missing {key}");
    }

    let history = service
        .get_history(
            None,
            ExecutionFilter {
                status: Some(ExecutionStatus::Success),
                ..ExecutionFilter::default()
            },
            Pagination::new(1, 5),
        )
        .await?;
    assert_eq!(history.total, 1);

    let backwards = service
        .get_history(
            None,
            ExecutionFilter {
                from: Some(Utc::now()),
                to: Some(Utc::now() - Duration::days(1)),
                ..ExecutionFilter::default()
            },
            Pagination::default(),
        )
        .await;
    assert!(backwards.unwrap_err().is_validation());
    assert!(service
        .get_history(Some(9999), ExecutionFilter::default(), Pagination::default())
        .await
        .unwrap_err()
        .is_not_found());

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_evaluator_fires_due_timer_and_drops_paused_job() -> Result<()> {
    let cluster = TestCluster::new()?;
    let config = cluster.config();
    let node = cluster.node("node-a").await?;
    let service = node.service();
    let job = interval_job(&node, "timed", "noop", IntervalSpec::hours(1)).await?;

    let (_tx, rx) = job_set_channel();
    let mut evaluator = TriggerEvaluator::new(
        node.service(),
        node.repositories().jobs.clone(),
        rx,
        config.scheduler.clone(),
        ExecutionLogger::with_memory_sink(cluster.sink.clone()),
    );
    evaluator.sync().await?;
    assert_eq!(evaluator.timer_count(), 1);

    let due = evaluator.next_fire(job.id).expect("interval job is scheduled");
    assert_eq!(due, job.created_at + Duration::hours(1));
    assert_eq!(evaluator.tick(due - Duration::seconds(1)).await, 0);
    assert_eq!(evaluator.tick(due + Duration::seconds(1)).await, 1);
    node.wait_idle().await;

    let history = service
        .get_history(Some(job.id), ExecutionFilter::default(), Pagination::default())
        .await?;
    assert_eq!(history.total, 1);
    let execution = &history.items[0];
    assert_eq!(execution.trigger_source, TriggerSource::Scheduled);
    assert_eq!(execution.scheduled_at, due);
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(cluster.sink.count(LogEvent::TimerFired), 1);
    assert_eq!(evaluator.next_fire(job.id), Some(due + Duration::hours(1)));

    let paused = service.pause_job(job.id, None).await?;
    evaluator.apply(JobSetChange::Upsert(paused));
    assert_eq!(evaluator.timer_count(), 0);

    let resumed = service.resume_job(job.id, None).await?;
    evaluator.apply(JobSetChange::Upsert(resumed));
    assert_eq!(evaluator.timer_count(), 1);

    evaluator.apply(JobSetChange::Remove(job.id));
    assert_eq!(evaluator.timer_count(), 0);

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_pause_on_one_node_stops_timer_fires_on_another() -> Result<()> {
    let cluster = TestCluster::new()?;
    let config = cluster.config();
    let node_a = cluster.node("node-a").await?;
    let node_b = cluster.node("node-b").await?;
    let job = interval_job(&node_a, "shared timer", "noop", IntervalSpec::hours(1)).await?;

    // 节点B的定时器集合在暂停前已同步，之后收不到节点A的变更推送
    let (_tx, rx) = job_set_channel();
    let mut evaluator = TriggerEvaluator::new(
        node_b.service(),
        node_b.repositories().jobs.clone(),
        rx,
        config.scheduler.clone(),
        ExecutionLogger::with_memory_sink(cluster.sink.clone()),
    );
    evaluator.sync().await?;
    let due = evaluator.next_fire(job.id).expect("interval job is scheduled");

    node_a.service().pause_job(job.id, Some(1)).await?;
    assert_eq!(evaluator.timer_count(), 1);
    assert_eq!(evaluator.tick(due + Duration::seconds(1)).await, 0);

    let err = node_b
        .service()
        .trigger_scheduled(job.id, due)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("paused"));

    // 手动触发不受暂停影响
    node_b.service().trigger_now(job.id, Some(1)).await?;
    node_b.wait_idle().await;
    let history = node_a
        .service()
        .get_history(Some(job.id), ExecutionFilter::default(), Pagination::default())
        .await?;
    assert_eq!(history.total, 1);
    assert_eq!(history.items[0].trigger_source, TriggerSource::Manual);

    // 下一次同步后定时器被移除
    evaluator.sync().await?;
    assert_eq!(evaluator.timer_count(), 0);

    node_a.shutdown().await?;
    node_b.shutdown().await?;
    Ok(())
}
