use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{ExecutionStatus, InstanceMode, JobKind, TriggerSource};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 间隔调度参数，四个字段共同组成总间隔
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalSpec {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub days: i64,
}

impl IntervalSpec {
    pub fn hours(hours: i64) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn seconds(seconds: i64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn total_seconds(&self) -> i64 {
        self.seconds + self.minutes * 60 + self.hours * 3600 + self.days * 86_400
    }

    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.total_seconds())
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.seconds < 0 || self.minutes < 0 || self.hours < 0 || self.days < 0 {
            return Err(SchedulerError::validation_error(
                "interval fields must not be negative",
            ));
        }
        if self.total_seconds() <= 0 {
            return Err(SchedulerError::validation_error(
                "interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// 作业调度参数：间隔与CRON二选一
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSchedule {
    Interval(IntervalSpec),
    Cron { expression: String },
}

impl JobSchedule {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSchedule::Interval(_) => JobKind::Interval,
            JobSchedule::Cron { .. } => JobKind::Cron,
        }
    }

    pub fn interval(&self) -> Option<&IntervalSpec> {
        match self {
            JobSchedule::Interval(spec) => Some(spec),
            JobSchedule::Cron { .. } => None,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            JobSchedule::Interval(_) => None,
            JobSchedule::Cron { expression } => Some(expression),
        }
    }

    /// 由存储列或请求字段组装调度参数，要求恰好一个家族被填充
    pub fn from_parts(
        interval: Option<IntervalSpec>,
        cron_expression: Option<String>,
    ) -> SchedulerResult<Self> {
        let cron_expression = cron_expression.filter(|expr| !expr.trim().is_empty());
        match (interval, cron_expression) {
            (Some(spec), None) => {
                spec.validate()?;
                Ok(JobSchedule::Interval(spec))
            }
            (None, Some(expression)) => Ok(JobSchedule::Cron {
                expression: expression.trim().to_string(),
            }),
            (Some(_), Some(_)) => Err(SchedulerError::validation_error(
                "schedule must specify either an interval or a cron expression, not both",
            )),
            (None, None) => Err(SchedulerError::validation_error(
                "schedule must specify an interval or a cron expression",
            )),
        }
    }

    /// 校验调度家族与声明的作业类型一致
    pub fn ensure_matches(&self, declared: JobKind) -> SchedulerResult<()> {
        if self.kind() != declared {
            return Err(SchedulerError::validation_error(format!(
                "schedule family {} does not match job type {}",
                self.kind().as_str(),
                declared.as_str()
            )));
        }
        if let JobSchedule::Interval(spec) = self {
            spec.validate()?;
        }
        Ok(())
    }
}

/// 分页参数，页码从1开始
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub const MAX_PAGE_SIZE: u32 = 200;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: Pagination) -> Self {
        Self {
            items,
            total,
            page: pagination.page,
            page_size: pagination.page_size,
        }
    }

    pub fn total_pages(&self) -> i64 {
        if self.page_size == 0 {
            0
        } else {
            (self.total + i64::from(self.page_size) - 1) / i64::from(self.page_size)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub is_enabled: Option<bool>,
    pub job_type: Option<JobKind>,
    pub task_function_id: Option<i64>,
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub job_id: Option<i64>,
    pub status: Option<ExecutionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 新建作业的完整描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub task_function_id: i64,
    pub job_type: JobKind,
    pub schedule: JobSchedule,
    pub parameters: serde_json::Value,
    pub priority: i32,
    pub max_instances: i32,
    pub misfire_grace_time: i32,
    pub coalesce: bool,
    pub is_enabled: bool,
    pub is_primary: bool,
    pub created_by: Option<i64>,
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        task_function_id: i64,
        schedule: JobSchedule,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            task_function_id,
            job_type: schedule.kind(),
            schedule,
            parameters: serde_json::json!({}),
            priority: 0,
            max_instances: 1,
            misfire_grace_time: 60,
            coalesce: true,
            is_enabled: true,
            is_primary: true,
            created_by: None,
        }
    }
}

/// 作业的部分更新
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub task_function_id: Option<i64>,
    pub job_type: Option<JobKind>,
    pub schedule: Option<JobSchedule>,
    pub parameters: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_instances: Option<i32>,
    pub misfire_grace_time: Option<i32>,
    pub coalesce: Option<bool>,
    pub is_enabled: Option<bool>,
    pub is_primary: Option<bool>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.task_function_id.is_none()
            && self.job_type.is_none()
            && self.schedule.is_none()
            && self.parameters.is_none()
            && self.priority.is_none()
            && self.max_instances.is_none()
            && self.misfire_grace_time.is_none()
            && self.coalesce.is_none()
            && self.is_enabled.is_none()
            && self.is_primary.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub total_jobs: i64,
    pub enabled_jobs: i64,
    pub disabled_jobs: i64,
}

/// 待创建的执行记录
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_id: Uuid,
    pub job_id: i64,
    pub trigger_source: TriggerSource,
    pub triggered_by: Option<i64>,
    pub parent_execution_id: Option<Uuid>,
    pub correlation_id: String,
    pub scheduled_at: DateTime<Utc>,
}

/// 原子查重插入的结果
#[derive(Debug, Clone)]
pub enum CreateExecutionResult {
    Created(crate::entities::JobExecution),
    Duplicate { conflicting_execution_id: Uuid },
}

/// 调度层写回的终态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub duration_ms: i64,
    pub attempts: i32,
}

impl ExecutionOutcome {
    pub fn success(summary: impl Into<String>, duration_ms: i64, attempts: i32) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result_summary: Some(summary.into()),
            error_message: None,
            error_traceback: None,
            duration_ms,
            attempts,
        }
    }

    pub fn failed(
        message: impl Into<String>,
        traceback: Option<String>,
        duration_ms: i64,
        attempts: i32,
    ) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result_summary: None,
            error_message: Some(message.into()),
            error_traceback: traceback,
            duration_ms,
            attempts,
        }
    }
}

/// 加锁并转入运行态的请求
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub job_id: i64,
    pub instance_id: i64,
    pub execution_id: Uuid,
    pub run_id: String,
    pub host_name: String,
    pub ttl: chrono::Duration,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum LockAcquisition {
    Acquired(crate::entities::ExecutionLock),
    Held {
        holder_instance_id: i64,
        expires_at: DateTime<Utc>,
    },
    ExecutionNotPending,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub instance_name: String,
    pub host_name: String,
    pub process_id: i64,
    pub mode: InstanceMode,
}

#[derive(Debug, Clone)]
pub struct NewTaskFunction {
    pub key: String,
    pub implementation: String,
    pub version: i32,
    pub name_en: String,
    pub name_ar: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_executions: u64,
    pub deleted_locks: u64,
    pub deleted_instances: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.deleted_executions + self.deleted_locks + self.deleted_instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_requires_exactly_one_family() {
        assert!(JobSchedule::from_parts(None, None).is_err());
        assert!(JobSchedule::from_parts(
            Some(IntervalSpec::hours(1)),
            Some("0 * * * *".to_string())
        )
        .is_err());
        assert_eq!(
            JobSchedule::from_parts(None, Some("  ".to_string())).unwrap_err().status_code(),
            400
        );
        let schedule = JobSchedule::from_parts(Some(IntervalSpec::hours(4)), None).unwrap();
        assert_eq!(schedule.kind(), JobKind::Interval);
        assert_eq!(schedule.cron_expression(), None);
    }

    #[test]
    fn test_interval_validation() {
        assert!(IntervalSpec::default().validate().is_err());
        assert!(IntervalSpec {
            seconds: -1,
            minutes: 5,
            ..IntervalSpec::default()
        }
        .validate()
        .is_err());
        let spec = IntervalSpec {
            seconds: 30,
            minutes: 1,
            hours: 1,
            days: 1,
        };
        assert_eq!(spec.total_seconds(), 30 + 60 + 3600 + 86_400);
    }

    #[test]
    fn test_schedule_matches_declared_type() {
        let cron = JobSchedule::Cron {
            expression: "*/5 * * * *".to_string(),
        };
        assert!(cron.ensure_matches(JobKind::Cron).is_ok());
        assert!(cron.ensure_matches(JobKind::Interval).is_err());
    }

    #[test]
    fn test_pagination_bounds() {
        let p = Pagination::new(0, 1000);
        assert_eq!(p.page, 1);
        assert_eq!(p.page_size, Pagination::MAX_PAGE_SIZE);
        assert_eq!(Pagination::new(3, 20).offset(), 40);

        let page: Page<i32> = Page::new(vec![1, 2], 41, Pagination::new(1, 20));
        assert_eq!(page.total_pages(), 3);
    }
}
