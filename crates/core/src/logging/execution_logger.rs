//! 结构化执行日志
//!
//! 执行的每个阶段（触发、加锁、派发、重试）都输出一条携带关联ID和执行上下文的
//! [`LogRecord`]，按执行ID过滤日志即可还原一次执行的完整生命周期。

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::execution_context::ExecutionContext;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEvent {
    TriggerReceived,
    TriggerRejected,
    DuplicateCheckRejected,
    ExecutionCreated,
    BackgroundTaskLaunched,
    LockAcquired,
    LockRejected,
    LockReleased,
    LockReleaseFailed,
    ExecutionSkipped,
    DispatchStarted,
    DispatchAttemptStarted,
    DispatchAttemptFailed,
    DispatchRetryScheduled,
    DispatchSoftLimitReached,
    DispatchSuccess,
    DispatchFailed,
    ResourcesDisposed,
    ExecutionReaped,
    StatusWriteFailed,
    TimerFired,
    MisfireSkipped,
    CleanupCompleted,
    InstanceRegistered,
    InstanceStopped,
    HeartbeatFailed,
}

impl LogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::TriggerReceived => "TRIGGER_RECEIVED",
            LogEvent::TriggerRejected => "TRIGGER_REJECTED",
            LogEvent::DuplicateCheckRejected => "DUPLICATE_CHECK_REJECTED",
            LogEvent::ExecutionCreated => "EXECUTION_CREATED",
            LogEvent::BackgroundTaskLaunched => "BACKGROUND_TASK_LAUNCHED",
            LogEvent::LockAcquired => "LOCK_ACQUIRED",
            LogEvent::LockRejected => "LOCK_REJECTED",
            LogEvent::LockReleased => "LOCK_RELEASED",
            LogEvent::LockReleaseFailed => "LOCK_RELEASE_FAILED",
            LogEvent::ExecutionSkipped => "EXECUTION_SKIPPED",
            LogEvent::DispatchStarted => "DISPATCH_STARTED",
            LogEvent::DispatchAttemptStarted => "DISPATCH_ATTEMPT_STARTED",
            LogEvent::DispatchAttemptFailed => "DISPATCH_ATTEMPT_FAILED",
            LogEvent::DispatchRetryScheduled => "DISPATCH_RETRY_SCHEDULED",
            LogEvent::DispatchSoftLimitReached => "DISPATCH_SOFT_LIMIT_REACHED",
            LogEvent::DispatchSuccess => "DISPATCH_SUCCESS",
            LogEvent::DispatchFailed => "DISPATCH_FAILED",
            LogEvent::ResourcesDisposed => "RESOURCES_DISPOSED",
            LogEvent::ExecutionReaped => "EXECUTION_REAPED",
            LogEvent::StatusWriteFailed => "STATUS_WRITE_FAILED",
            LogEvent::TimerFired => "TIMER_FIRED",
            LogEvent::MisfireSkipped => "MISFIRE_SKIPPED",
            LogEvent::CleanupCompleted => "CLEANUP_COMPLETED",
            LogEvent::InstanceRegistered => "INSTANCE_REGISTERED",
            LogEvent::InstanceStopped => "INSTANCE_STOPPED",
            LogEvent::HeartbeatFailed => "HEARTBEAT_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub event: LogEvent,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub message: String,
    pub context: BTreeMap<String, Value>,
    pub delta_ms: Option<i64>,
    pub total_duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl LogRecord {
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// 日志输出端
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord) -> Result<(), String>;
}

/// 默认输出端：转发为 tracing 事件
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: &LogRecord) -> Result<(), String> {
        let context = serde_json::to_string(&record.context).map_err(|e| e.to_string())?;
        let timestamp = record.timestamp.to_rfc3339();
        let event = record.event.as_str();
        let correlation_id = record.correlation_id.as_str();
        let error = record.error.as_deref();

        match record.severity {
            Severity::Debug => debug!(
                event,
                correlation_id,
                timestamp = %timestamp,
                context = %context,
                delta_ms = ?record.delta_ms,
                total_duration_ms = ?record.total_duration_ms,
                "{}",
                record.message
            ),
            Severity::Info => info!(
                event,
                correlation_id,
                timestamp = %timestamp,
                context = %context,
                delta_ms = ?record.delta_ms,
                total_duration_ms = ?record.total_duration_ms,
                "{}",
                record.message
            ),
            Severity::Warn => warn!(
                event,
                correlation_id,
                timestamp = %timestamp,
                context = %context,
                delta_ms = ?record.delta_ms,
                total_duration_ms = ?record.total_duration_ms,
                error = ?error,
                "{}",
                record.message
            ),
            Severity::Error => error!(
                event,
                correlation_id,
                timestamp = %timestamp,
                context = %context,
                delta_ms = ?record.delta_ms,
                total_duration_ms = ?record.total_duration_ms,
                error = ?error,
                "{}",
                record.message
            ),
        }
        Ok(())
    }
}

/// 内存输出端，测试中用于按执行ID重建生命周期
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn for_execution(&self, execution_id: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.context_str("execution_id") == Some(execution_id))
            .collect()
    }

    pub fn count(&self, event: LogEvent) -> usize {
        self.records().iter().filter(|r| r.event == event).count()
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: &LogRecord) -> Result<(), String> {
        self.records
            .lock()
            .map_err(|_| "memory sink poisoned".to_string())?
            .push(record.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct ExecutionLogger {
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
}

impl ExecutionLogger {
    pub fn new() -> Self {
        Self::with_sinks(vec![Arc::new(TracingSink)])
    }

    pub fn with_sinks(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// tracing 输出之外再挂一个内存输出端
    pub fn with_memory_sink(sink: MemorySink) -> Self {
        Self::with_sinks(vec![Arc::new(TracingSink), Arc::new(sink)])
    }

    pub fn log(
        &self,
        ctx: &ExecutionContext,
        event: LogEvent,
        severity: Severity,
        message: impl Into<String>,
        error: Option<&str>,
    ) {
        let now = Utc::now();
        let (delta_ms, total_duration_ms) = ctx.mark(now);
        let record = LogRecord {
            event,
            severity,
            timestamp: now,
            correlation_id: ctx.correlation_id().to_string(),
            message: message.into(),
            context: ctx.fields().clone(),
            delta_ms,
            total_duration_ms,
            error: error.map(str::to_string),
        };
        self.emit(&record);
    }

    pub fn debug(&self, ctx: &ExecutionContext, event: LogEvent, message: impl Into<String>) {
        self.log(ctx, event, Severity::Debug, message, None);
    }

    pub fn info(&self, ctx: &ExecutionContext, event: LogEvent, message: impl Into<String>) {
        self.log(ctx, event, Severity::Info, message, None);
    }

    pub fn warn(
        &self,
        ctx: &ExecutionContext,
        event: LogEvent,
        message: impl Into<String>,
        error: Option<&str>,
    ) {
        self.log(ctx, event, Severity::Warn, message, error);
    }

    pub fn error(
        &self,
        ctx: &ExecutionContext,
        event: LogEvent,
        message: impl Into<String>,
        error: &str,
    ) {
        self.log(ctx, event, Severity::Error, message, Some(error));
    }

    /// 输出端失败不得掩盖业务错误，这里吞掉错误和panic
    fn emit(&self, record: &LogRecord) {
        for sink in self.sinks.iter() {
            let _ = catch_unwind(AssertUnwindSafe(|| sink.write(record)));
        }
    }
}

impl Default for ExecutionLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLogger")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    impl LogSink for FailingSink {
        fn write(&self, _record: &LogRecord) -> Result<(), String> {
            panic!("sink exploded");
        }
    }

    #[test]
    fn test_records_carry_correlation_and_context() {
        let sink = MemorySink::new();
        let logger = ExecutionLogger::with_sinks(vec![Arc::new(sink.clone())]);
        let ctx = ExecutionContext::with_correlation_id("corr-9")
            .with("job_id", 3)
            .with("execution_id", "exec-1");

        logger.info(&ctx, LogEvent::TriggerReceived, "trigger");
        logger.error(&ctx, LogEvent::DispatchFailed, "boom", "io error");

        let records = sink.for_execution("exec-1");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.correlation_id == "corr-9"));
        assert_eq!(records[0].context.get("job_id"), Some(&json!(3)));
        assert_eq!(records[0].delta_ms, None);
        assert_eq!(records[0].total_duration_ms, Some(0));
        assert!(records[1].delta_ms.is_some());
        assert_eq!(records[1].error.as_deref(), Some("io error"));
        assert_eq!(sink.count(LogEvent::DispatchFailed), 1);
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let sink = MemorySink::new();
        let logger = ExecutionLogger::with_sinks(vec![Arc::new(FailingSink), Arc::new(sink.clone())]);
        let ctx = ExecutionContext::new();

        logger.warn(&ctx, LogEvent::LockRejected, "held elsewhere", None);

        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_event_names_serialize_screaming_snake() {
        let value = serde_json::to_value(LogEvent::DuplicateCheckRejected).unwrap();
        assert_eq!(value, json!("DUPLICATE_CHECK_REJECTED"));
        assert_eq!(LogEvent::LockAcquired.as_str(), "LOCK_ACQUIRED");
    }
}
