use scheduler_errors::SchedulerError;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

/// 交给HTTP层序列化的错误体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Scheduler(err) => err.status_code(),
            ApiError::BadRequest(_) => 400,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Scheduler(SchedulerError::NotFound { .. }) => "NOT_FOUND",
            ApiError::Scheduler(SchedulerError::InvalidCron { .. }) => "INVALID_CRON_EXPRESSION",
            ApiError::Scheduler(SchedulerError::ValidationError(_)) => "VALIDATION_ERROR",
            ApiError::Scheduler(SchedulerError::Timeout(_)) => "TIMEOUT",
            ApiError::Scheduler(err) if err.is_database() => "DATABASE_ERROR",
            ApiError::Scheduler(_) => "INTERNAL_ERROR",
            ApiError::BadRequest(_) => "BAD_REQUEST",
        }
    }

    /// 客户端可见的错误体；5xx 错误不暴露内部细节
    pub fn to_body(&self) -> ErrorBody {
        let status = self.status_code();
        let (message, details) = match self {
            ApiError::Scheduler(err) if status >= 500 => {
                tracing::error!("内部错误: {}", err);
                (err.user_message().to_string(), None)
            }
            ApiError::Scheduler(err) => (err.user_message().to_string(), Some(err.to_string())),
            ApiError::BadRequest(msg) => ("请求参数错误".to_string(), Some(msg.clone())),
        };
        ErrorBody {
            status,
            code: self.error_code().to_string(),
            message,
            details,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let err = ApiError::from(SchedulerError::job_not_found(7));
        let body = err.to_body();

        assert_eq!(body.status, 404);
        assert_eq!(body.code, "NOT_FOUND");
        assert!(body.details.unwrap_or_default().contains('7'));
    }

    #[test]
    fn test_invalid_cron_maps_to_400() {
        let err = ApiError::from(SchedulerError::InvalidCron {
            expr: "bad".to_string(),
            message: "unexpected token".to_string(),
        });

        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_code(), "INVALID_CRON_EXPRESSION");
    }

    #[test]
    fn test_database_error_hides_details() {
        let err = ApiError::from(SchedulerError::database_error("disk I/O error"));
        let body = err.to_body();

        assert_eq!(body.status, 500);
        assert_eq!(body.code, "DATABASE_ERROR");
        assert!(body.details.is_none());
    }

    #[test]
    fn test_bad_request() {
        let body = ApiError::bad_request("unknown action").to_body();
        assert_eq!(body.status, 400);
        assert_eq!(body.details.as_deref(), Some("unknown action"));
    }
}
