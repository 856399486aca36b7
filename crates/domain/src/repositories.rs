//! 领域仓储抽象
//!
//! 作业与执行记录由调度服务独占写入；锁与实例记录由锁/心跳子系统独占写入。
//! 两者共享同一事务性存储，使加锁与执行状态迁移能够一起提交。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::entities::{
    ExecutionLock, ExecutionStatusInfo, InstanceStatus, JobExecution, JobType, ScheduledJob,
    SchedulerInstance, TaskFunction,
};
use crate::value_objects::{
    CreateExecutionResult, ExecutionFilter, ExecutionOutcome, JobCounts, JobFilter, LockAcquisition,
    LockRequest, NewExecution, NewInstance, NewJob, NewTaskFunction, Page, Pagination,
};
use scheduler_errors::SchedulerResult;

/// 参考数据仓储（任务函数、作业类型、执行状态）
#[async_trait]
pub trait ReferenceDataRepository: Send + Sync {
    async fn list_task_functions(&self, active_only: bool) -> SchedulerResult<Vec<TaskFunction>>;
    async fn get_task_function(&self, id: i64) -> SchedulerResult<Option<TaskFunction>>;
    async fn get_task_function_by_key(&self, key: &str) -> SchedulerResult<Option<TaskFunction>>;
    async fn upsert_task_function(&self, function: &NewTaskFunction) -> SchedulerResult<TaskFunction>;
    async fn list_job_types(&self) -> SchedulerResult<Vec<JobType>>;
    async fn list_execution_statuses(&self) -> SchedulerResult<Vec<ExecutionStatusInfo>>;
}

/// 作业仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &NewJob) -> SchedulerResult<ScheduledJob>;
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<ScheduledJob>>;
    async fn list(&self, filter: &JobFilter, pagination: Pagination) -> SchedulerResult<Page<ScheduledJob>>;
    /// 以完整记录覆盖可变字段
    async fn update(&self, job: &ScheduledJob) -> SchedulerResult<ScheduledJob>;
    async fn set_enabled(&self, id: i64, enabled: bool, updated_by: Option<i64>) -> SchedulerResult<ScheduledJob>;
    async fn set_paused(&self, id: i64, paused: bool, updated_by: Option<i64>) -> SchedulerResult<ScheduledJob>;
    async fn soft_delete(&self, id: i64, updated_by: Option<i64>) -> SchedulerResult<()>;
    async fn touch_last_run(&self, id: i64, at: DateTime<Utc>) -> SchedulerResult<()>;
    /// 定时器候选集：启用、未暂停、未删除的主作业
    async fn timer_driven_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>>;
    async fn counts(&self) -> SchedulerResult<JobCounts>;
}

/// 执行记录仓储
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 原子查重插入：作业不存在非终态执行时才写入 pending 记录
    async fn create_if_idle(&self, execution: &NewExecution) -> SchedulerResult<CreateExecutionResult>;
    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<JobExecution>>;
    async fn find_active_for_job(&self, job_id: i64) -> SchedulerResult<Option<JobExecution>>;
    async fn list(&self, filter: &ExecutionFilter, pagination: Pagination) -> SchedulerResult<Page<JobExecution>>;
    async fn recent(&self, limit: i64) -> SchedulerResult<Vec<JobExecution>>;
    /// pending → skipped
    async fn mark_skipped(&self, execution_id: Uuid, reason: &str) -> SchedulerResult<JobExecution>;
    /// 重试过程中记录尝试次数，仅对持锁实例的运行中记录生效
    async fn record_attempt(&self, execution_id: Uuid, executor_id: i64, attempts: i32) -> SchedulerResult<()>;
    /// running → success | failed，仅持锁实例可写
    async fn complete(
        &self,
        execution_id: Uuid,
        executor_id: i64,
        outcome: &ExecutionOutcome,
    ) -> SchedulerResult<JobExecution>;
    /// 回收执行实例已失联的非终态记录，返回回收数量
    async fn reap_abandoned(
        &self,
        job_id: Option<i64>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> SchedulerResult<u64>;
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64>;
}

/// 分布式锁仓储
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// 单事务完成：清除过期锁、条件插入新锁、pending → running
    async fn acquire_and_start(&self, request: &LockRequest) -> SchedulerResult<LockAcquisition>;
    async fn release(&self, job_id: i64, instance_id: i64) -> SchedulerResult<bool>;
    async fn release_all_for_instance(&self, instance_id: i64) -> SchedulerResult<u64>;
    async fn get(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>>;
    /// 删除已过期且持有实例心跳陈旧（或实例不存在）的锁
    async fn delete_abandoned(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> SchedulerResult<u64>;
}

/// 调度实例仓储
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn register(&self, instance: &NewInstance) -> SchedulerResult<SchedulerInstance>;
    async fn get(&self, id: i64) -> SchedulerResult<Option<SchedulerInstance>>;
    async fn heartbeat(&self, id: i64, at: DateTime<Utc>) -> SchedulerResult<()>;
    async fn set_status(&self, id: i64, status: InstanceStatus) -> SchedulerResult<()>;
    async fn mark_stopped(&self, id: i64, at: DateTime<Utc>) -> SchedulerResult<()>;
    async fn list_live(&self, stale_before: DateTime<Utc>) -> SchedulerResult<Vec<SchedulerInstance>>;
    async fn delete_stale(&self, stale_before: DateTime<Utc>) -> SchedulerResult<u64>;
}
