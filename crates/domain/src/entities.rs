use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::JobSchedule;

/// 调度方式：固定间隔或CRON
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Interval,
    Cron,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Interval => "interval",
            JobKind::Cron => "cron",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(JobKind::Interval),
            "cron" => Ok(JobKind::Cron),
            _ => Err(format!("Invalid job type: {s}")),
        }
    }
}

/// 作业类型参考数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobType {
    pub code: JobKind,
    pub name_en: String,
    pub name_ar: String,
    pub description: Option<String>,
    pub is_active: bool,
}

/// 可执行工作单元的命名引用
///
/// `implementation` 是任务注册表中的处理器键，作业创建时校验其存在。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFunction {
    pub id: i64,
    pub key: String,
    pub implementation: String,
    pub version: i32,
    pub name_en: String,
    pub name_ar: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// 执行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Success,
        ExecutionStatus::Failed,
        ExecutionStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Skipped
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

/// 执行状态参考数据（双语标签）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusInfo {
    pub code: ExecutionStatus,
    pub name_en: String,
    pub name_ar: String,
    pub is_terminal: bool,
    pub is_active: bool,
    pub sort_order: i32,
}

/// 触发来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "MANUAL",
            TriggerSource::Scheduled => "SCHEDULED",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(TriggerSource::Manual),
            "SCHEDULED" => Ok(TriggerSource::Scheduled),
            _ => Err(format!("Invalid trigger source: {s}")),
        }
    }
}

/// 可调度作业
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub task_function_id: i64,
    pub task_function_key: String,
    pub job_type: JobKind,
    pub schedule: JobSchedule,
    pub parameters: serde_json::Value,
    pub priority: i32,
    pub max_instances: i32,
    pub misfire_grace_time: i32,
    pub coalesce: bool,
    pub is_enabled: bool,
    pub is_active: bool,
    pub is_primary: bool,
    pub is_paused: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// 是否可由手动触发产生新的执行
    pub fn can_trigger(&self) -> bool {
        self.is_active && self.is_enabled
    }

    /// 是否参与定时器驱动的触发
    pub fn is_timer_driven(&self) -> bool {
        self.can_trigger() && !self.is_paused && self.is_primary
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::seconds(i64::from(self.misfire_grace_time))
    }
}

/// 单次运行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
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
    pub created_at: DateTime<Utc>,
}

impl JobExecution {
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// 调度实例运行模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceMode {
    Embedded,
    Standalone,
}

impl InstanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceMode::Embedded => "embedded",
            InstanceMode::Standalone => "standalone",
        }
    }
}

impl FromStr for InstanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(InstanceMode::Embedded),
            "standalone" => Ok(InstanceMode::Standalone),
            _ => Err(format!("Invalid instance mode: {s}")),
        }
    }
}

/// 调度实例状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "paused" => Ok(InstanceStatus::Paused),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            _ => Err(format!("Invalid instance status: {s}")),
        }
    }
}

/// 调度器进程（存活或历史）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerInstance {
    pub id: i64,
    pub instance_name: String,
    pub host_name: String,
    pub process_id: i64,
    pub mode: InstanceMode,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl SchedulerInstance {
    /// 检查心跳是否超过陈旧阈值
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        now - self.last_heartbeat > staleness
    }

    pub fn is_alive(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        !matches!(self.status, InstanceStatus::Stopped) && !self.is_heartbeat_expired(now, staleness)
    }
}

/// 作业级互斥锁
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLock {
    pub job_id: i64,
    pub instance_id: i64,
    pub execution_id: Option<Uuid>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
