use thiserror::Error;


/// 调度核心错误类型
///
/// 三类对外语义：`NotFound`（404）、`ValidationError`（4xx）、数据库错误（5xx，触发回滚）。
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("{entity}未找到: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn job_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "作业",
            id: id.to_string(),
        }
    }
    pub fn execution_not_found<S: ToString>(execution_id: S) -> Self {
        Self::NotFound {
            entity: "执行记录",
            id: execution_id.to_string(),
        }
    }
    pub fn task_function_not_found<S: ToString>(key: S) -> Self {
        Self::NotFound {
            entity: "任务函数",
            id: key.to_string(),
        }
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::NotFound { .. })
    }
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::ValidationError(_) | SchedulerError::InvalidCron { .. }
        )
    }
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::DatabaseOperation(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::DatabaseOperation(_)
                | SchedulerError::TaskExecution(_)
                | SchedulerError::Timeout(_)
        )
    }
    /// HTTP层使用的状态码映射
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::NotFound { .. } => 404,
            SchedulerError::ValidationError(_) | SchedulerError::InvalidCron { .. } => 400,
            _ => 500,
        }
    }
    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::NotFound { .. } => "请求的资源不存在",
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::InvalidCron { .. } => "CRON表达式无效",
            SchedulerError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
