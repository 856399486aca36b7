use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use scheduler_core::{ExecutionContext, ExecutionLogger, LockConfig, LogEvent};
use scheduler_domain::{
    entities::ScheduledJob,
    repositories::LockRepository,
    value_objects::{LockAcquisition, LockRequest},
};
use scheduler_errors::SchedulerResult;
use serde_json::json;
use uuid::Uuid;

/// 作业级分布式锁
///
/// 加锁与 pending → running 在同一事务中提交；TTL 取自作业的 `misfire_grace_time`，
/// 持有者崩溃后锁会自行过期。
#[derive(Clone)]
pub struct LockManager {
    locks: Arc<dyn LockRepository>,
    config: LockConfig,
    instance_id: i64,
    host_name: String,
    logger: ExecutionLogger,
}

impl LockManager {
    pub fn new(
        locks: Arc<dyn LockRepository>,
        config: LockConfig,
        instance_id: i64,
        host_name: impl Into<String>,
        logger: ExecutionLogger,
    ) -> Self {
        Self {
            locks,
            config,
            instance_id,
            host_name: host_name.into(),
            logger,
        }
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// 尝试加锁并把执行转入 running
    pub async fn acquire(
        &self,
        job: &ScheduledJob,
        execution_id: Uuid,
        run_id: &str,
        ctx: &ExecutionContext,
    ) -> SchedulerResult<LockAcquisition> {
        let ttl = self.config.ttl_for(job.misfire_grace_time);
        let request = LockRequest {
            job_id: job.id,
            instance_id: self.instance_id,
            execution_id,
            run_id: run_id.to_string(),
            host_name: self.host_name.clone(),
            ttl,
            now: Utc::now(),
        };

        let acquisition = self.locks.acquire_and_start(&request).await?;
        match &acquisition {
            LockAcquisition::Acquired(lock) => {
                counter!("scheduler_lock_acquisitions_total", "result" => "acquired").increment(1);
                self.logger.info(
                    &ctx.child([("lock_expires_at", json!(lock.expires_at.to_rfc3339()))]),
                    LogEvent::LockAcquired,
                    format!("lock acquired for job {} (ttl {}s)", job.id, ttl.num_seconds()),
                );
            }
            LockAcquisition::Held {
                holder_instance_id,
                expires_at,
            } => {
                counter!("scheduler_lock_acquisitions_total", "result" => "held").increment(1);
                self.logger.warn(
                    &ctx.child([("holder_instance_id", json!(holder_instance_id))]),
                    LogEvent::LockRejected,
                    format!(
                        "lock for job {} held by instance {holder_instance_id} until {}",
                        job.id,
                        expires_at.to_rfc3339()
                    ),
                    None,
                );
            }
            LockAcquisition::ExecutionNotPending => {
                counter!("scheduler_lock_acquisitions_total", "result" => "not_pending")
                    .increment(1);
                self.logger.warn(
                    ctx,
                    LogEvent::LockRejected,
                    "execution is no longer pending",
                    None,
                );
            }
        }
        Ok(acquisition)
    }

    /// 释放锁；释放失败只记录日志，锁会随TTL过期
    pub async fn release(&self, job_id: i64, ctx: &ExecutionContext) -> bool {
        match self.locks.release(job_id, self.instance_id).await {
            Ok(released) => {
                self.logger.debug(
                    ctx,
                    LogEvent::LockReleased,
                    if released {
                        format!("lock released for job {job_id}")
                    } else {
                        format!("no lock held for job {job_id}")
                    },
                );
                released
            }
            Err(e) => {
                self.logger.warn(
                    ctx,
                    LogEvent::LockReleaseFailed,
                    format!("failed to release lock for job {job_id}"),
                    Some(&e.to_string()),
                );
                false
            }
        }
    }

    pub async fn release_all(&self) -> SchedulerResult<u64> {
        self.locks.release_all_for_instance(self.instance_id).await
    }
}
