use std::sync::Arc;

use scheduler_dispatcher::SchedulerService;
use scheduler_domain::entities::{ExecutionStatusInfo, JobType, TaskFunction};
use scheduler_errors::SchedulerError;
use tracing::debug;
use uuid::Uuid;

use crate::dto::{
    CleanupRequest, CleanupResponse, CreateCronJobRequest, CreateIntervalJobRequest,
    CreateJobRequest, ExecutionResponse, HistoryQuery, JobAction, JobActionRequest,
    JobActionResponse, JobListQuery, JobResponse, StatusResponse, UpdateJobRequest,
};
use crate::error::ApiResult;
use crate::response::PaginatedResponse;

/// 作业生命周期、历史、状态、清理与参考数据接口
///
/// HTTP层只负责路由与反序列化，所有业务语义都在 [`SchedulerService`] 中。
#[derive(Clone)]
pub struct SchedulerApi {
    service: Arc<SchedulerService>,
}

impl SchedulerApi {
    pub fn new(service: Arc<SchedulerService>) -> Self {
        Self { service }
    }

    // ---- 作业 ----

    pub async fn create_interval_job(
        &self,
        request: CreateIntervalJobRequest,
    ) -> ApiResult<JobResponse> {
        let job = self.service.create_job(request.into_new_job()).await?;
        Ok(job.into())
    }

    pub async fn create_cron_job(&self, request: CreateCronJobRequest) -> ApiResult<JobResponse> {
        let job = self.service.create_job(request.into_new_job()).await?;
        Ok(job.into())
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> ApiResult<JobResponse> {
        let job = self.service.create_job(request.into_new_job()?).await?;
        Ok(job.into())
    }

    pub async fn get_job(&self, id: i64) -> ApiResult<JobResponse> {
        Ok(self.service.get_job(id).await?.into())
    }

    pub async fn list_jobs(&self, query: JobListQuery) -> ApiResult<PaginatedResponse<JobResponse>> {
        let page = self
            .service
            .list_jobs(&query.filter(), query.pagination())
            .await?;
        Ok(PaginatedResponse::from_page(page, JobResponse::from))
    }

    pub async fn update_job(&self, id: i64, request: UpdateJobRequest) -> ApiResult<JobResponse> {
        let updated_by = request.updated_by;
        let patch = request.into_patch()?;
        Ok(self.service.update_job(id, patch, updated_by).await?.into())
    }

    pub async fn delete_job(&self, id: i64, deleted_by: Option<i64>) -> ApiResult<()> {
        self.service.delete_job(id, deleted_by).await?;
        Ok(())
    }

    /// 单一动作端点
    ///
    /// 作业不存在返回错误；被业务规则拒绝（已禁用、正在运行）时返回 `success = false`。
    pub async fn job_action(
        &self,
        id: i64,
        request: JobActionRequest,
    ) -> ApiResult<JobActionResponse> {
        let user = request.user_id;
        let result = match request.action {
            JobAction::Trigger => self
                .service
                .trigger_now(id, user)
                .await
                .map(|execution_id| JobActionResponse {
                    success: true,
                    message: format!("job {id} triggered"),
                    execution_id: Some(execution_id),
                    job: None,
                }),
            action => {
                let job = match action {
                    JobAction::Enable => self.service.enable_job(id, user).await,
                    JobAction::Disable => self.service.disable_job(id, user).await,
                    JobAction::Pause => self.service.pause_job(id, user).await,
                    _ => self.service.resume_job(id, user).await,
                };
                job.map(|job| JobActionResponse {
                    success: true,
                    message: format!("job {id} {}d", action.as_str()),
                    execution_id: None,
                    job: Some(job.into()),
                })
            }
        };

        match result {
            Ok(response) => Ok(response),
            Err(SchedulerError::ValidationError(message)) => {
                debug!(job_id = id, action = request.action.as_str(), "作业动作被拒绝: {}", message);
                Ok(JobActionResponse {
                    success: false,
                    message,
                    execution_id: None,
                    job: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 以手动方式重跑一条已结束的执行
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        user_id: Option<i64>,
    ) -> ApiResult<JobActionResponse> {
        let new_execution = self.service.retry_execution(execution_id, user_id).await?;
        Ok(JobActionResponse {
            success: true,
            message: format!("execution {execution_id} retried"),
            execution_id: Some(new_execution),
            job: None,
        })
    }

    // ---- 历史与状态 ----

    pub async fn job_history(
        &self,
        job_id: i64,
        query: HistoryQuery,
    ) -> ApiResult<PaginatedResponse<ExecutionResponse>> {
        let page = self
            .service
            .get_history(Some(job_id), query.filter(), query.pagination())
            .await?;
        Ok(PaginatedResponse::from_page(page, ExecutionResponse::from))
    }

    pub async fn history(
        &self,
        query: HistoryQuery,
    ) -> ApiResult<PaginatedResponse<ExecutionResponse>> {
        let page = self
            .service
            .get_history(None, query.filter(), query.pagination())
            .await?;
        Ok(PaginatedResponse::from_page(page, ExecutionResponse::from))
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> ApiResult<ExecutionResponse> {
        Ok(self.service.get_execution(execution_id).await?.into())
    }

    pub async fn status(&self) -> ApiResult<StatusResponse> {
        Ok(self.service.status().await?.into())
    }

    pub async fn cleanup(&self, request: CleanupRequest) -> ApiResult<CleanupResponse> {
        Ok(self.service.cleanup(request.retention_days).await?.into())
    }

    // ---- 参考数据 ----

    pub async fn task_functions(&self) -> ApiResult<Vec<TaskFunction>> {
        Ok(self.service.task_functions().await?)
    }

    pub async fn job_types(&self) -> ApiResult<Vec<JobType>> {
        Ok(self.service.job_types().await?)
    }

    pub async fn execution_statuses(&self) -> ApiResult<Vec<ExecutionStatusInfo>> {
        Ok(self.service.execution_statuses().await?)
    }
}
