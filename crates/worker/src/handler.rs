use async_trait::async_trait;
use scheduler_core::ExecutionContext;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::attempt_scope::AttemptScope;

/// 处理器在任务函数表中的展示信息
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub version: i32,
    pub name_en: String,
    pub name_ar: String,
    pub description: Option<String>,
}

/// 处理器一次成功执行的结果
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub summary: String,
}

impl TaskOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

/// 单次尝试的上下文
pub struct AttemptContext<'a> {
    pub execution_id: Uuid,
    pub job_id: i64,
    pub attempt: u32,
    pub parameters: &'a Value,
    pub context: &'a ExecutionContext,
    pub scope: &'a AttemptScope,
    soft_limit: watch::Receiver<bool>,
}

impl<'a> AttemptContext<'a> {
    pub fn new(
        execution_id: Uuid,
        job_id: i64,
        attempt: u32,
        parameters: &'a Value,
        context: &'a ExecutionContext,
        scope: &'a AttemptScope,
        soft_limit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            execution_id,
            job_id,
            attempt,
            parameters,
            context,
            scope,
            soft_limit,
        }
    }

    /// 软时限已到，处理器应尽快回滚并返回
    pub fn soft_limit_reached(&self) -> bool {
        *self.soft_limit.borrow()
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

/// 静态注册的任务处理器
///
/// 返回错误即视为本次尝试失败；处理器应在事务中写入外部系统，
/// 失败时丢弃事务以回滚部分副作用。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn key(&self) -> &'static str;

    fn descriptor(&self) -> HandlerDescriptor;

    async fn run(&self, attempt: &AttemptContext<'_>) -> anyhow::Result<TaskOutput>;
}
