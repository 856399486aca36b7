use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use metrics::counter;
use scheduler_core::{DispatchConfig, ExecutionContext, ExecutionLogger, LogEvent};
use scheduler_domain::{
    entities::{ExecutionStatus, JobExecution},
    repositories::ExecutionRepository,
    value_objects::ExecutionOutcome,
};
use scheduler_errors::SchedulerResult;
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::attempt_scope::AttemptScope;
use crate::handler::{AttemptContext, TaskHandler, TaskOutput};
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;

/// 软/硬时限
#[derive(Debug, Clone, Copy)]
pub struct TimeLimits {
    /// 到期后通知处理器收尾
    pub soft: Duration,
    /// 到期后强制中止本次尝试
    pub hard: Duration,
}

impl From<&DispatchConfig> for TimeLimits {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            soft: config.soft_time_limit(),
            hard: config.hard_time_limit(),
        }
    }
}

/// 已加锁、已转入 running 的一次执行
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub execution_id: Uuid,
    pub job_id: i64,
    /// 持锁实例，只有它能写回终态
    pub executor_id: i64,
    pub task_key: String,
    pub parameters: Value,
    pub context: ExecutionContext,
}

/// 带重试的执行包装层
pub struct RetryingDispatcher {
    registry: Arc<TaskRegistry>,
    executions: Arc<dyn ExecutionRepository>,
    policy: RetryPolicy,
    limits: TimeLimits,
    logger: ExecutionLogger,
}

impl RetryingDispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        executions: Arc<dyn ExecutionRepository>,
        policy: RetryPolicy,
        limits: TimeLimits,
        logger: ExecutionLogger,
    ) -> Self {
        Self {
            registry,
            executions,
            policy,
            limits,
            logger,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// 执行并写回终态
    pub async fn dispatch(&self, job: DispatchJob) -> SchedulerResult<JobExecution> {
        let ctx = job.context.child([
            ("stage", json!("dispatch")),
            ("task_key", json!(job.task_key.clone())),
            ("executor_id", json!(job.executor_id)),
        ]);
        self.logger.info(
            &ctx,
            LogEvent::DispatchStarted,
            format!("dispatching task function {}", job.task_key),
        );

        let outcome = self.run_attempts(&job, &ctx).await;

        match self
            .executions
            .complete(job.execution_id, job.executor_id, &outcome)
            .await
        {
            Ok(execution) => {
                counter!("scheduler_executions_total", "status" => execution.status.as_str())
                    .increment(1);
                if execution.status == ExecutionStatus::Success {
                    self.logger.info(
                        &ctx,
                        LogEvent::DispatchSuccess,
                        format!(
                            "succeeded after {} attempt(s): {}",
                            outcome.attempts,
                            outcome.result_summary.as_deref().unwrap_or_default()
                        ),
                    );
                } else {
                    self.logger.error(
                        &ctx,
                        LogEvent::DispatchFailed,
                        format!("failed after {} attempt(s)", outcome.attempts),
                        outcome.error_message.as_deref().unwrap_or("unknown error"),
                    );
                }
                Ok(execution)
            }
            Err(e) => {
                self.logger.error(
                    &ctx,
                    LogEvent::StatusWriteFailed,
                    "could not persist terminal status",
                    &e.to_string(),
                );
                Err(e)
            }
        }
    }

    async fn run_attempts(&self, job: &DispatchJob, ctx: &ExecutionContext) -> ExecutionOutcome {
        let Some(handler) = self.registry.get(&job.task_key) else {
            return ExecutionOutcome::failed(
                format!("no handler registered for task function '{}'", job.task_key),
                None,
                0,
                0,
            );
        };

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let attempt_ctx = ctx.child([("attempt", json!(attempt))]);
            self.logger.info(
                &attempt_ctx,
                LogEvent::DispatchAttemptStarted,
                format!("attempt {attempt}/{}", self.policy.max_attempts()),
            );
            counter!("scheduler_dispatch_attempts_total").increment(1);

            let attempt_started = Instant::now();
            let result = self
                .run_once(handler.as_ref(), job, attempt, &attempt_ctx)
                .await;
            let attempt_ms = attempt_started.elapsed().as_millis() as i64;

            let err = match result {
                Ok(output) => {
                    return ExecutionOutcome::success(output.summary, attempt_ms, attempt as i32)
                }
                Err(err) => err,
            };

            let message = format!("{err:#}");
            self.logger.warn(
                &attempt_ctx,
                LogEvent::DispatchAttemptFailed,
                format!("attempt {attempt} failed"),
                Some(&message),
            );

            if !self.policy.should_retry(attempt) {
                return ExecutionOutcome::failed(
                    message,
                    Some(format!("{err:?}")),
                    started.elapsed().as_millis() as i64,
                    attempt as i32,
                );
            }

            if let Err(e) = self
                .executions
                .record_attempt(job.execution_id, job.executor_id, attempt as i32)
                .await
            {
                self.logger.warn(
                    &attempt_ctx,
                    LogEvent::StatusWriteFailed,
                    "could not record attempt count",
                    Some(&e.to_string()),
                );
            }

            let delay = self.policy.delay_for(attempt);
            self.logger.info(
                &attempt_ctx,
                LogEvent::DispatchRetryScheduled,
                format!("retrying in {}ms", delay.as_millis()),
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once(
        &self,
        handler: &dyn TaskHandler,
        job: &DispatchJob,
        attempt: u32,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<TaskOutput> {
        let scope = AttemptScope::new();
        let (soft_tx, soft_rx) = watch::channel(false);

        let soft_limit = self.limits.soft;
        let logger = self.logger.clone();
        let soft_ctx = ctx.clone();
        let soft_timer = tokio::spawn(async move {
            tokio::time::sleep(soft_limit).await;
            let _ = soft_tx.send(true);
            logger.warn(
                &soft_ctx,
                LogEvent::DispatchSoftLimitReached,
                format!("soft time limit of {}ms reached", soft_limit.as_millis()),
                None,
            );
        });

        let attempt_ctx = AttemptContext::new(
            job.execution_id,
            job.job_id,
            attempt,
            &job.parameters,
            ctx,
            &scope,
            soft_rx,
        );
        let result = match tokio::time::timeout(self.limits.hard, handler.run(&attempt_ctx)).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "hard time limit of {}ms exceeded",
                self.limits.hard.as_millis()
            )),
        };
        soft_timer.abort();

        let disposed = scope.dispose_all().await;
        if disposed > 0 {
            self.logger.debug(
                ctx,
                LogEvent::ResourcesDisposed,
                format!("disposed {disposed} attempt-scoped resource(s)"),
            );
        }

        result
    }
}
