//! 请求与响应DTO
//!
//! 线上格式统一使用 camelCase；调度参数按间隔四字段与 `cronExpression` 平铺。

use chrono::{DateTime, Utc};
use scheduler_dispatcher::{NextRun, SchedulerStatus};
use scheduler_domain::{
    entities::{
        ExecutionStatus, InstanceMode, InstanceStatus, JobExecution, JobKind, ScheduledJob,
        SchedulerInstance, TriggerSource,
    },
    value_objects::{
        CleanupReport, ExecutionFilter, IntervalSpec, JobFilter, JobPatch, JobSchedule, NewJob,
        Pagination,
    },
};
use scheduler_errors::SchedulerResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 间隔调度字段，任一字段出现即视为间隔调度
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntervalFields {
    pub interval_seconds: Option<i64>,
    pub interval_minutes: Option<i64>,
    pub interval_hours: Option<i64>,
    pub interval_days: Option<i64>,
}

impl IntervalFields {
    pub fn to_spec(self) -> Option<IntervalSpec> {
        if self.interval_seconds.is_none()
            && self.interval_minutes.is_none()
            && self.interval_hours.is_none()
            && self.interval_days.is_none()
        {
            return None;
        }
        Some(IntervalSpec {
            seconds: self.interval_seconds.unwrap_or(0),
            minutes: self.interval_minutes.unwrap_or(0),
            hours: self.interval_hours.unwrap_or(0),
            days: self.interval_days.unwrap_or(0),
        })
    }

    fn from_spec(spec: Option<&IntervalSpec>) -> Self {
        match spec {
            Some(spec) => Self {
                interval_seconds: Some(spec.seconds),
                interval_minutes: Some(spec.minutes),
                interval_hours: Some(spec.hours),
                interval_days: Some(spec.days),
            },
            None => Self::default(),
        }
    }
}

/// 创建请求共用的可选设置，缺省值与 [`NewJob::new`] 一致
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    pub description: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_instances: Option<i32>,
    pub misfire_grace_time: Option<i32>,
    pub coalesce: Option<bool>,
    pub is_enabled: Option<bool>,
    pub is_primary: Option<bool>,
    pub created_by: Option<i64>,
}

impl JobSettings {
    fn build(self, name: String, task_function_id: i64, schedule: JobSchedule) -> NewJob {
        let mut job = NewJob::new(name, task_function_id, schedule);
        job.description = self.description;
        if let Some(parameters) = self.parameters {
            job.parameters = parameters;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(max_instances) = self.max_instances {
            job.max_instances = max_instances;
        }
        if let Some(grace) = self.misfire_grace_time {
            job.misfire_grace_time = grace;
        }
        if let Some(coalesce) = self.coalesce {
            job.coalesce = coalesce;
        }
        if let Some(is_enabled) = self.is_enabled {
            job.is_enabled = is_enabled;
        }
        if let Some(is_primary) = self.is_primary {
            job.is_primary = is_primary;
        }
        job.created_by = self.created_by;
        job
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntervalJobRequest {
    pub name: String,
    pub task_function_id: i64,
    #[serde(default)]
    pub interval_seconds: i64,
    #[serde(default)]
    pub interval_minutes: i64,
    #[serde(default)]
    pub interval_hours: i64,
    #[serde(default)]
    pub interval_days: i64,
    #[serde(flatten)]
    pub settings: JobSettings,
}

impl CreateIntervalJobRequest {
    pub fn into_new_job(self) -> NewJob {
        let spec = IntervalSpec {
            seconds: self.interval_seconds,
            minutes: self.interval_minutes,
            hours: self.interval_hours,
            days: self.interval_days,
        };
        self.settings
            .build(self.name, self.task_function_id, JobSchedule::Interval(spec))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCronJobRequest {
    pub name: String,
    pub task_function_id: i64,
    pub cron_expression: String,
    #[serde(flatten)]
    pub settings: JobSettings,
}

impl CreateCronJobRequest {
    pub fn into_new_job(self) -> NewJob {
        let schedule = JobSchedule::Cron {
            expression: self.cron_expression.trim().to_string(),
        };
        self.settings
            .build(self.name, self.task_function_id, schedule)
    }
}

/// 统一创建请求：声明作业类型，间隔字段与CRON表达式二选一
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub name: String,
    pub task_function_id: i64,
    pub job_type: JobKind,
    #[serde(flatten)]
    pub interval: IntervalFields,
    pub cron_expression: Option<String>,
    #[serde(flatten)]
    pub settings: JobSettings,
}

impl CreateJobRequest {
    pub fn into_new_job(self) -> SchedulerResult<NewJob> {
        let schedule = JobSchedule::from_parts(self.interval.to_spec(), self.cron_expression)?;
        let mut job = self
            .settings
            .build(self.name, self.task_function_id, schedule);
        job.job_type = self.job_type;
        Ok(job)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub task_function_id: Option<i64>,
    pub job_type: Option<JobKind>,
    #[serde(flatten)]
    pub interval: IntervalFields,
    pub cron_expression: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_instances: Option<i32>,
    pub misfire_grace_time: Option<i32>,
    pub coalesce: Option<bool>,
    pub is_enabled: Option<bool>,
    pub is_primary: Option<bool>,
    pub updated_by: Option<i64>,
}

impl UpdateJobRequest {
    pub fn into_patch(self) -> SchedulerResult<JobPatch> {
        let interval = self.interval.to_spec();
        let schedule = if interval.is_some() || self.cron_expression.is_some() {
            Some(JobSchedule::from_parts(interval, self.cron_expression)?)
        } else {
            None
        };
        Ok(JobPatch {
            name: self.name,
            description: self.description,
            task_function_id: self.task_function_id,
            job_type: self.job_type,
            schedule,
            parameters: self.parameters,
            priority: self.priority,
            max_instances: self.max_instances,
            misfire_grace_time: self.misfire_grace_time,
            coalesce: self.coalesce,
            is_enabled: self.is_enabled,
            is_primary: self.is_primary,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListQuery {
    pub is_enabled: Option<bool>,
    pub job_type: Option<JobKind>,
    pub task_function_id: Option<i64>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl JobListQuery {
    pub fn filter(&self) -> JobFilter {
        JobFilter {
            is_enabled: self.is_enabled,
            job_type: self.job_type,
            task_function_id: self.task_function_id,
            include_inactive: false,
        }
    }

    pub fn pagination(&self) -> Pagination {
        pagination(self.page, self.page_size)
    }
}

fn pagination(page: Option<u32>, page_size: Option<u32>) -> Pagination {
    let default = Pagination::default();
    Pagination::new(
        page.unwrap_or(default.page),
        page_size.unwrap_or(default.page_size),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub task_function_id: i64,
    pub task_function_key: String,
    pub job_type: JobKind,
    #[serde(flatten)]
    pub interval: IntervalFields,
    pub cron_expression: Option<String>,
    pub parameters: serde_json::Value,
    pub priority: i32,
    pub max_instances: i32,
    pub misfire_grace_time: i32,
    pub coalesce: bool,
    pub is_enabled: bool,
    pub is_paused: bool,
    pub is_primary: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl From<ScheduledJob> for JobResponse {
    fn from(job: ScheduledJob) -> Self {
        Self {
            interval: IntervalFields::from_spec(job.schedule.interval()),
            cron_expression: job.schedule.cron_expression().map(str::to_string),
            id: job.id,
            name: job.name,
            description: job.description,
            task_function_id: job.task_function_id,
            task_function_key: job.task_function_key,
            job_type: job.job_type,
            parameters: job.parameters,
            priority: job.priority,
            max_instances: job.max_instances,
            misfire_grace_time: job.misfire_grace_time,
            coalesce: job.coalesce,
            is_enabled: job.is_enabled,
            is_paused: job.is_paused,
            is_primary: job.is_primary,
            created_by: job.created_by,
            created_at: job.created_at,
            updated_by: job.updated_by,
            updated_at: job.updated_at,
            last_run_at: job.last_run_at,
        }
    }
}

/// 作业动作端点接受的动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Enable,
    Disable,
    Trigger,
    Pause,
    Resume,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Enable => "enable",
            JobAction::Disable => "disable",
            JobAction::Trigger => "trigger",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionRequest {
    pub action: JobAction,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub status: Option<ExecutionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl HistoryQuery {
    pub fn filter(&self) -> ExecutionFilter {
        ExecutionFilter {
            job_id: None,
            status: self.status,
            from: self.from,
            to: self.to,
        }
    }

    pub fn pagination(&self) -> Pagination {
        pagination(self.page, self.page_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: Uuid,
    pub job_id: i64,
    pub run_id: Option<String>,
    pub trigger_source: TriggerSource,
    pub triggered_by: Option<i64>,
    pub parent_execution_id: Option<Uuid>,
    pub correlation_id: String,
    pub status: ExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub result_summary: Option<String>,
    pub executor_id: Option<i64>,
    pub host_name: Option<String>,
}

impl From<JobExecution> for ExecutionResponse {
    fn from(execution: JobExecution) -> Self {
        Self {
            execution_id: execution.execution_id,
            job_id: execution.job_id,
            run_id: execution.run_id,
            trigger_source: execution.trigger_source,
            triggered_by: execution.triggered_by,
            parent_execution_id: execution.parent_execution_id,
            correlation_id: execution.correlation_id,
            status: execution.status,
            scheduled_at: execution.scheduled_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms: execution.duration_ms,
            attempts: execution.attempts,
            error_message: execution.error_message,
            error_traceback: execution.error_traceback,
            result_summary: execution.result_summary,
            executor_id: execution.executor_id,
            host_name: execution.host_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    pub id: i64,
    pub instance_name: String,
    pub host_name: String,
    pub process_id: i64,
    pub mode: InstanceMode,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl From<SchedulerInstance> for InstanceResponse {
    fn from(instance: SchedulerInstance) -> Self {
        Self {
            id: instance.id,
            instance_name: instance.instance_name,
            host_name: instance.host_name,
            process_id: instance.process_id,
            mode: instance.mode,
            status: instance.status,
            last_heartbeat: instance.last_heartbeat,
            started_at: instance.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextRunResponse {
    pub job_id: i64,
    pub job_name: String,
    pub next_run_at: DateTime<Utc>,
}

impl From<NextRun> for NextRunResponse {
    fn from(next: NextRun) -> Self {
        Self {
            job_id: next.job_id,
            job_name: next.job_name,
            next_run_at: next.next_run_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub total_jobs: i64,
    pub enabled_jobs: i64,
    pub disabled_jobs: i64,
    pub live_instances: Vec<InstanceResponse>,
    pub next_run: Option<NextRunResponse>,
    pub recent_executions: Vec<ExecutionResponse>,
}

impl From<SchedulerStatus> for StatusResponse {
    fn from(status: SchedulerStatus) -> Self {
        Self {
            total_jobs: status.counts.total_jobs,
            enabled_jobs: status.counts.enabled_jobs,
            disabled_jobs: status.counts.disabled_jobs,
            live_instances: status.live_instances.into_iter().map(Into::into).collect(),
            next_run: status.next_run.map(Into::into),
            recent_executions: status
                .recent_executions
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

fn default_retention_days() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for CleanupRequest {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub deleted_executions: u64,
    pub deleted_locks: u64,
    pub deleted_instances: u64,
    pub total: u64,
}

impl From<CleanupReport> for CleanupResponse {
    fn from(report: CleanupReport) -> Self {
        Self {
            deleted_executions: report.deleted_executions,
            deleted_locks: report.deleted_locks,
            deleted_instances: report.deleted_instances,
            total: report.total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interval_request_defaults() {
        let request: CreateIntervalJobRequest = serde_json::from_value(json!({
            "name": "sync",
            "taskFunctionId": 3,
            "intervalHours": 4,
        }))
        .unwrap();
        let job = request.into_new_job();

        assert_eq!(job.job_type, JobKind::Interval);
        assert_eq!(job.schedule.interval().map(|spec| spec.total_seconds()), Some(4 * 3600));
        assert_eq!(job.max_instances, 1);
        assert!(job.coalesce);
    }

    #[test]
    fn test_unified_request_rejects_both_families() {
        let request: CreateJobRequest = serde_json::from_value(json!({
            "name": "both",
            "taskFunctionId": 1,
            "jobType": "cron",
            "intervalMinutes": 5,
            "cronExpression": "0 */5 * * * *",
        }))
        .unwrap();

        assert!(request.into_new_job().unwrap_err().is_validation());
    }

    #[test]
    fn test_unified_request_keeps_declared_type() {
        let request: CreateJobRequest = serde_json::from_value(json!({
            "name": "mismatch",
            "taskFunctionId": 1,
            "jobType": "interval",
            "cronExpression": "0 0 * * * *",
            "maxInstances": 2,
        }))
        .unwrap();
        let job = request.into_new_job().unwrap();

        assert_eq!(job.job_type, JobKind::Interval);
        assert_eq!(job.schedule.kind(), JobKind::Cron);
        assert!(job.schedule.ensure_matches(job.job_type).is_err());
        assert_eq!(job.max_instances, 2);
    }

    #[test]
    fn test_update_without_schedule_fields() {
        let patch = UpdateJobRequest {
            priority: Some(5),
            ..UpdateJobRequest::default()
        }
        .into_patch()
        .unwrap();

        assert!(patch.schedule.is_none());
        assert_eq!(patch.priority, Some(5));
    }

    #[test]
    fn test_action_response_omits_empty_fields() {
        let response = JobActionResponse {
            success: false,
            message: "job 1 is disabled".to_string(),
            execution_id: None,
            job: None,
        };
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json, json!({"success": false, "message": "job 1 is disabled"}));
    }

    #[test]
    fn test_cleanup_request_default_retention() {
        let request: CleanupRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request.retention_days, 30);

        let response = CleanupResponse::from(CleanupReport {
            deleted_executions: 3,
            deleted_locks: 1,
            deleted_instances: 0,
        });
        assert_eq!(response.total, 4);
    }
}
