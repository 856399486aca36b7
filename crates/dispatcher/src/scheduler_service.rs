//! 调度服务
//!
//! 作业与执行记录的唯一写入方。触发协议：加载作业 → 回收失联执行 →
//! 原子查重并插入 pending → 交给后台启动器，调用方拿到执行ID立即返回。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use scheduler_core::{ExecutionContext, ExecutionLogger, HeartbeatConfig, LogEvent};
use scheduler_domain::{
    entities::{
        ExecutionStatusInfo, JobExecution, JobKind, JobType, ScheduledJob, SchedulerInstance, TaskFunction,
        TriggerSource,
    },
    value_objects::{
        CleanupReport, CreateExecutionResult, ExecutionFilter, JobCounts, JobFilter, JobPatch,
        JobSchedule, NewExecution, NewJob, Page, Pagination,
    },
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::Repositories;
use scheduler_worker::TaskRegistry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cleanup::CleanupService;
use crate::cron_utils::validate_schedule;
use crate::launcher::Launcher;
use crate::trigger_evaluator::{initial_next_fire, JobSetChange, JobSetSender};

const RECENT_EXECUTIONS: i64 = 10;

/// 最近一次即将发生的定时触发
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextRun {
    pub job_id: i64,
    pub job_name: String,
    pub next_run_at: DateTime<Utc>,
}

/// 调度器状态汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub counts: JobCounts,
    pub live_instances: Vec<SchedulerInstance>,
    pub next_run: Option<NextRun>,
    pub recent_executions: Vec<JobExecution>,
}

/// 触发请求
struct TriggerRequest {
    job_id: i64,
    source: TriggerSource,
    triggered_by: Option<i64>,
    parent_execution_id: Option<Uuid>,
    scheduled_at: DateTime<Utc>,
}

pub struct SchedulerService {
    repos: Repositories,
    registry: Arc<TaskRegistry>,
    launcher: Arc<Launcher>,
    cleanup: CleanupService,
    heartbeat: HeartbeatConfig,
    job_set: Option<JobSetSender>,
    logger: ExecutionLogger,
}

impl SchedulerService {
    pub fn new(
        repos: Repositories,
        registry: Arc<TaskRegistry>,
        launcher: Arc<Launcher>,
        cleanup: CleanupService,
        heartbeat: HeartbeatConfig,
        logger: ExecutionLogger,
    ) -> Self {
        Self {
            repos,
            registry,
            launcher,
            cleanup,
            heartbeat,
            job_set: None,
            logger,
        }
    }

    /// 启停/暂停变更推送给触发评估器
    pub fn with_job_set_listener(mut self, sender: JobSetSender) -> Self {
        self.job_set = Some(sender);
        self
    }

    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    fn notify(&self, change: JobSetChange) {
        if let Some(sender) = &self.job_set {
            if sender.send(change).is_err() {
                debug!("触发评估器已停止，忽略作业集合变更");
            }
        }
    }

    // ---- 作业管理 ----

    async fn validate_definition(
        &self,
        name: &str,
        task_function_id: i64,
        schedule: &JobSchedule,
        job_type: JobKind,
        max_instances: i32,
        misfire_grace_time: i32,
    ) -> SchedulerResult<()> {
        if name.trim().is_empty() {
            return Err(SchedulerError::validation_error("job name must not be empty"));
        }
        schedule.ensure_matches(job_type)?;
        validate_schedule(schedule)?;
        if !(1..=10).contains(&max_instances) {
            return Err(SchedulerError::validation_error(
                "max_instances must be between 1 and 10",
            ));
        }
        if misfire_grace_time < 0 {
            return Err(SchedulerError::validation_error(
                "misfire_grace_time must not be negative",
            ));
        }

        let function = self
            .repos
            .reference_data
            .get_task_function(task_function_id)
            .await?
            .ok_or_else(|| SchedulerError::task_function_not_found(task_function_id))?;
        if !function.is_active {
            return Err(SchedulerError::validation_error(format!(
                "task function '{}' is inactive",
                function.key
            )));
        }
        self.registry.ensure_registered(&function.key)
    }

    pub async fn create_job(&self, job: NewJob) -> SchedulerResult<ScheduledJob> {
        self.validate_definition(
            &job.name,
            job.task_function_id,
            &job.schedule,
            job.job_type,
            job.max_instances,
            job.misfire_grace_time,
        )
        .await?;

        let created = self.repos.jobs.create(&job).await?;
        info!(job_id = created.id, name = %created.name, "作业已创建");
        self.notify(JobSetChange::Upsert(created.clone()));
        Ok(created)
    }

    pub async fn get_job(&self, id: i64) -> SchedulerResult<ScheduledJob> {
        self.repos
            .jobs
            .get_by_id(id)
            .await?
            .filter(|job| job.is_active)
            .ok_or_else(|| SchedulerError::job_not_found(id))
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> SchedulerResult<Page<ScheduledJob>> {
        self.repos.jobs.list(filter, pagination).await
    }

    pub async fn update_job(
        &self,
        id: i64,
        patch: JobPatch,
        updated_by: Option<i64>,
    ) -> SchedulerResult<ScheduledJob> {
        let mut job = self.get_job(id).await?;
        if patch.is_empty() {
            return Ok(job);
        }

        if let Some(schedule) = patch.schedule {
            // 只改调度参数时作业类型随之变化
            if patch.job_type.is_none() {
                job.job_type = schedule.kind();
            }
            job.schedule = schedule;
        }
        if let Some(job_type) = patch.job_type {
            job.job_type = job_type;
        }
        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(description) = patch.description {
            job.description = Some(description);
        }
        if let Some(task_function_id) = patch.task_function_id {
            job.task_function_id = task_function_id;
        }
        if let Some(parameters) = patch.parameters {
            job.parameters = parameters;
        }
        if let Some(priority) = patch.priority {
            job.priority = priority;
        }
        if let Some(max_instances) = patch.max_instances {
            job.max_instances = max_instances;
        }
        if let Some(grace) = patch.misfire_grace_time {
            job.misfire_grace_time = grace;
        }
        if let Some(coalesce) = patch.coalesce {
            job.coalesce = coalesce;
        }
        if let Some(is_enabled) = patch.is_enabled {
            job.is_enabled = is_enabled;
        }
        if let Some(is_primary) = patch.is_primary {
            job.is_primary = is_primary;
        }
        job.updated_by = updated_by;

        self.validate_definition(
            &job.name,
            job.task_function_id,
            &job.schedule,
            job.job_type,
            job.max_instances,
            job.misfire_grace_time,
        )
        .await?;

        let updated = self.repos.jobs.update(&job).await?;
        info!(job_id = id, "作业已更新");
        self.notify(JobSetChange::Upsert(updated.clone()));
        Ok(updated)
    }

    /// 软删除，之后该作业不再出现在列表和定时器集合中
    pub async fn delete_job(&self, id: i64, deleted_by: Option<i64>) -> SchedulerResult<()> {
        self.repos.jobs.soft_delete(id, deleted_by).await?;
        info!(job_id = id, "作业已删除");
        self.notify(JobSetChange::Remove(id));
        Ok(())
    }

    pub async fn enable_job(&self, id: i64, user: Option<i64>) -> SchedulerResult<ScheduledJob> {
        let job = self.repos.jobs.set_enabled(id, true, user).await?;
        self.notify(JobSetChange::Upsert(job.clone()));
        Ok(job)
    }

    pub async fn disable_job(&self, id: i64, user: Option<i64>) -> SchedulerResult<ScheduledJob> {
        let job = self.repos.jobs.set_enabled(id, false, user).await?;
        self.notify(JobSetChange::Upsert(job.clone()));
        Ok(job)
    }

    /// 暂停定时触发，不影响手动触发
    pub async fn pause_job(&self, id: i64, user: Option<i64>) -> SchedulerResult<ScheduledJob> {
        let job = self.repos.jobs.set_paused(id, true, user).await?;
        self.notify(JobSetChange::Upsert(job.clone()));
        Ok(job)
    }

    pub async fn resume_job(&self, id: i64, user: Option<i64>) -> SchedulerResult<ScheduledJob> {
        let job = self.repos.jobs.set_paused(id, false, user).await?;
        self.notify(JobSetChange::Upsert(job.clone()));
        Ok(job)
    }

    // ---- 触发 ----

    /// 手动触发，返回新执行的ID
    pub async fn trigger_now(&self, job_id: i64, triggered_by: Option<i64>) -> SchedulerResult<Uuid> {
        self.trigger(TriggerRequest {
            job_id,
            source: TriggerSource::Manual,
            triggered_by,
            parent_execution_id: None,
            scheduled_at: Utc::now(),
        })
        .await
    }

    /// 定时器触发
    pub async fn trigger_scheduled(
        &self,
        job_id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> SchedulerResult<Uuid> {
        self.trigger(TriggerRequest {
            job_id,
            source: TriggerSource::Scheduled,
            triggered_by: None,
            parent_execution_id: None,
            scheduled_at,
        })
        .await
    }

    /// 以手动方式重跑一条终态执行，新执行记录父执行ID
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        triggered_by: Option<i64>,
    ) -> SchedulerResult<Uuid> {
        let parent = self.get_execution(execution_id).await?;
        if !parent.is_finished() {
            return Err(SchedulerError::validation_error(format!(
                "execution {execution_id} is {}, only finished executions can be retried",
                parent.status.as_str()
            )));
        }
        self.trigger(TriggerRequest {
            job_id: parent.job_id,
            source: TriggerSource::Manual,
            triggered_by,
            parent_execution_id: Some(execution_id),
            scheduled_at: Utc::now(),
        })
        .await
    }

    async fn trigger(&self, request: TriggerRequest) -> SchedulerResult<Uuid> {
        let mut ctx = ExecutionContext::new()
            .with("job_id", request.job_id)
            .with("trigger_source", request.source.as_str());
        if let Some(user_id) = request.triggered_by {
            ctx.insert("user_id", user_id);
        }
        if let Some(parent) = request.parent_execution_id {
            ctx.insert("parent_execution_id", parent.to_string());
        }

        counter!("scheduler_triggers_total").increment(1);
        self.logger
            .info(&ctx, LogEvent::TriggerReceived, "trigger received");

        let job = match self.get_job(request.job_id).await {
            Ok(job) => job,
            Err(e) => {
                self.logger.warn(
                    &ctx,
                    LogEvent::TriggerRejected,
                    "job not found",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        };
        if !job.can_trigger() {
            let err = SchedulerError::validation_error(format!("job {} is disabled", job.id));
            self.logger.warn(
                &ctx,
                LogEvent::TriggerRejected,
                "job is disabled",
                Some(&err.to_string()),
            );
            return Err(err);
        }
        // 其他实例的定时器集合可能尚未同步，定时触发以存储中的暂停/主作业标记为准
        if request.source == TriggerSource::Scheduled && !job.is_timer_driven() {
            let reason = if job.is_paused { "paused" } else { "not primary" };
            let err = SchedulerError::validation_error(format!("job {} is {reason}", job.id));
            self.logger.info(
                &ctx,
                LogEvent::TriggerRejected,
                format!("scheduled fire ignored, job is {reason}"),
            );
            return Err(err);
        }

        self.reap_for_job(job.id, &ctx).await;

        let execution_id = Uuid::new_v4();
        ctx.insert("execution_id", execution_id.to_string());
        let new_execution = NewExecution {
            execution_id,
            job_id: job.id,
            trigger_source: request.source,
            triggered_by: request.triggered_by,
            parent_execution_id: request.parent_execution_id,
            correlation_id: ctx.correlation_id().to_string(),
            scheduled_at: request.scheduled_at,
        };

        let execution = match self.repos.executions.create_if_idle(&new_execution).await? {
            CreateExecutionResult::Created(execution) => execution,
            CreateExecutionResult::Duplicate {
                conflicting_execution_id,
            } => {
                let err = SchedulerError::validation_error(format!(
                    "job {} already running (execution {conflicting_execution_id})",
                    job.id
                ));
                self.logger.warn(
                    &ctx.child([(
                        "conflicting_execution_id",
                        json!(conflicting_execution_id.to_string()),
                    )]),
                    LogEvent::DuplicateCheckRejected,
                    "duplicate execution rejected",
                    Some(&err.to_string()),
                );
                return Err(err);
            }
        };

        self.logger.info(
            &ctx,
            LogEvent::ExecutionCreated,
            format!("pending execution created for job {}", job.name),
        );
        self.launcher.launch(job, execution, ctx).await;
        Ok(execution_id)
    }

    /// 回收该作业失联实例留下的执行；失败不阻断触发
    async fn reap_for_job(&self, job_id: i64, ctx: &ExecutionContext) {
        match self
            .repos
            .executions
            .reap_abandoned(Some(job_id), Utc::now(), self.heartbeat.staleness())
            .await
        {
            Ok(0) => {}
            Ok(reaped) => self.logger.warn(
                ctx,
                LogEvent::ExecutionReaped,
                format!("reaped {reaped} abandoned execution(s)"),
                None,
            ),
            Err(e) => self.logger.warn(
                ctx,
                LogEvent::ExecutionReaped,
                "reaping abandoned executions failed",
                Some(&e.to_string()),
            ),
        }
    }

    // ---- 历史与状态 ----

    pub async fn get_execution(&self, execution_id: Uuid) -> SchedulerResult<JobExecution> {
        self.repos
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| SchedulerError::execution_not_found(execution_id))
    }

    /// 单个作业或全局的执行历史
    pub async fn get_history(
        &self,
        job_id: Option<i64>,
        mut filter: ExecutionFilter,
        pagination: Pagination,
    ) -> SchedulerResult<Page<JobExecution>> {
        if let Some(job_id) = job_id {
            if self.repos.jobs.get_by_id(job_id).await?.is_none() {
                return Err(SchedulerError::job_not_found(job_id));
            }
            filter.job_id = Some(job_id);
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(SchedulerError::validation_error(
                    "history range start must not be after its end",
                ));
            }
        }
        self.repos.executions.list(&filter, pagination).await
    }

    pub async fn status(&self) -> SchedulerResult<SchedulerStatus> {
        let now = Utc::now();
        let counts = self.repos.jobs.counts().await?;
        let live_instances = self
            .repos
            .instances
            .list_live(now - self.heartbeat.staleness())
            .await?;
        let recent_executions = self.repos.executions.recent(RECENT_EXECUTIONS).await?;

        let next_run = self
            .repos
            .jobs
            .timer_driven_jobs()
            .await?
            .into_iter()
            .filter_map(|job| {
                let next = initial_next_fire(&job).ok().flatten()?;
                Some(NextRun {
                    job_id: job.id,
                    job_name: job.name,
                    next_run_at: next,
                })
            })
            .min_by_key(|run| run.next_run_at);

        Ok(SchedulerStatus {
            counts,
            live_instances,
            next_run,
            recent_executions,
        })
    }

    pub async fn cleanup(&self, retention_days: i64) -> SchedulerResult<CleanupReport> {
        self.cleanup.run_once(retention_days).await
    }

    // ---- 参考数据 ----

    pub async fn task_functions(&self) -> SchedulerResult<Vec<TaskFunction>> {
        self.repos.reference_data.list_task_functions(true).await
    }

    pub async fn job_types(&self) -> SchedulerResult<Vec<JobType>> {
        self.repos.reference_data.list_job_types().await
    }

    pub async fn execution_statuses(&self) -> SchedulerResult<Vec<ExecutionStatusInfo>> {
        self.repos.reference_data.list_execution_statuses().await
    }
}
