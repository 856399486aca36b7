//! 后台启动器
//!
//! 触发方在 pending 记录提交后立即返回；加锁、派发、写回终态和释放锁都在
//! 这里的后台任务中完成。加锁失败时执行标记为 skipped，不重试触发本身。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use scheduler_core::{ExecutionContext, ExecutionLogger, LogEvent};
use scheduler_domain::{
    entities::{JobExecution, ScheduledJob},
    repositories::{ExecutionRepository, JobRepository},
    value_objects::LockAcquisition,
};
use scheduler_worker::{DispatchJob, ExecutionStrategy, RetryingDispatcher};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lock_manager::LockManager;

pub struct Launcher {
    jobs: Arc<dyn JobRepository>,
    executions: Arc<dyn ExecutionRepository>,
    locks: LockManager,
    dispatcher: Arc<RetryingDispatcher>,
    strategy: Arc<ExecutionStrategy>,
    logger: ExecutionLogger,
    tasks: Mutex<JoinSet<()>>,
}

impl Launcher {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        executions: Arc<dyn ExecutionRepository>,
        locks: LockManager,
        dispatcher: Arc<RetryingDispatcher>,
        strategy: Arc<ExecutionStrategy>,
        logger: ExecutionLogger,
    ) -> Self {
        Self {
            jobs,
            executions,
            locks,
            dispatcher,
            strategy,
            logger,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// 派生后台任务，不等待其完成
    pub async fn launch(self: &Arc<Self>, job: ScheduledJob, execution: JobExecution, ctx: ExecutionContext) {
        let this = Arc::clone(self);
        let launch_ctx = ctx.clone();

        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { this.run(job, execution, ctx).await });

        self.logger.debug(
            &launch_ctx,
            LogEvent::BackgroundTaskLaunched,
            format!("background launch on {} strategy", self.strategy.name()),
        );
    }

    async fn run(&self, job: ScheduledJob, execution: JobExecution, ctx: ExecutionContext) {
        let run_id = Uuid::new_v4().to_string();
        let ctx = ctx.child([("run_id", json!(run_id.clone()))]);

        match self
            .locks
            .acquire(&job, execution.execution_id, &run_id, &ctx)
            .await
        {
            Ok(LockAcquisition::Acquired(_)) => {}
            Ok(LockAcquisition::Held {
                holder_instance_id, ..
            }) => {
                self.skip(
                    execution.execution_id,
                    &format!("lock held by instance {holder_instance_id}"),
                    &ctx,
                )
                .await;
                return;
            }
            Ok(LockAcquisition::ExecutionNotPending) => return,
            Err(e) => {
                self.skip(
                    execution.execution_id,
                    &format!("lock acquisition failed: {e}"),
                    &ctx,
                )
                .await;
                return;
            }
        }

        if let Err(e) = self.jobs.touch_last_run(job.id, Utc::now()).await {
            self.logger.warn(
                &ctx,
                LogEvent::StatusWriteFailed,
                "could not update last_run_at",
                Some(&e.to_string()),
            );
        }

        let dispatch = DispatchJob {
            execution_id: execution.execution_id,
            job_id: job.id,
            executor_id: self.locks.instance_id(),
            task_key: job.task_function_key.clone(),
            parameters: job.parameters.clone(),
            context: ctx.clone(),
        };
        if let Err(e) = self
            .strategy
            .execute(Arc::clone(&self.dispatcher), dispatch)
            .await
        {
            self.logger.error(
                &ctx,
                LogEvent::StatusWriteFailed,
                "dispatch did not produce a terminal status",
                &e.to_string(),
            );
        }

        self.locks.release(job.id, &ctx).await;
    }

    async fn skip(&self, execution_id: Uuid, reason: &str, ctx: &ExecutionContext) {
        match self.executions.mark_skipped(execution_id, reason).await {
            Ok(_) => {
                counter!("scheduler_executions_total", "status" => "skipped").increment(1);
                self.logger.warn(ctx, LogEvent::ExecutionSkipped, reason, None);
            }
            Err(e) => self.logger.error(
                ctx,
                LogEvent::StatusWriteFailed,
                "could not mark execution skipped",
                &e.to_string(),
            ),
        }
    }

    /// 等待当前所有后台任务结束
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("后台任务异常退出: {}", e);
                }
            }
        }
    }

    /// 关闭时在宽限期内等待在途执行，超时则中止
    pub async fn drain(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "等待在途执行完成");
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(remaining = tasks.len(), "宽限期已到，中止剩余后台任务");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
