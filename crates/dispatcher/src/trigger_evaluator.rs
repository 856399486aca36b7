//! 定时触发评估
//!
//! 每个实例独立维护自己的定时器集合，触发不做全局协调；并发只在执行时由锁裁决。
//! 集合周期性地从存储重新同步，服务层的启停/暂停通过通道即时推送。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use scheduler_core::{ExecutionContext, ExecutionLogger, LogEvent, SchedulerConfig};
use scheduler_domain::{entities::ScheduledJob, repositories::JobRepository, value_objects::JobSchedule};
use scheduler_errors::SchedulerResult;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cron_utils::CronScheduler;
use crate::scheduler_service::SchedulerService;

/// 单个作业一次最多保留或统计的触发次数
const MAX_EXPANDED_FIRES: usize = 1000;

/// 服务层推送给评估器的作业集合变更
#[derive(Debug, Clone)]
pub enum JobSetChange {
    Upsert(ScheduledJob),
    Remove(i64),
}

pub type JobSetSender = mpsc::UnboundedSender<JobSetChange>;
pub type JobSetReceiver = mpsc::UnboundedReceiver<JobSetChange>;

pub fn job_set_channel() -> (JobSetSender, JobSetReceiver) {
    mpsc::unbounded_channel()
}

/// 一次评估的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirePlan {
    /// 需要触发的计划时间
    pub fire_at: Vec<DateTime<Utc>>,
    /// 超出宽限期而放弃的次数（最多统计 `MAX_EXPANDED_FIRES` 次）
    pub misfired: usize,
    pub next_fire: Option<DateTime<Utc>>,
}

/// 作业的首次触发时间：间隔从 last_run_at（或创建时间）起算，CRON取其后的第一个时刻
pub fn initial_next_fire(job: &ScheduledJob) -> SchedulerResult<Option<DateTime<Utc>>> {
    let anchor = job.last_run_at.unwrap_or(job.created_at);
    crate::cron_utils::next_fire_time(&job.schedule, anchor)
}

/// 给定应触发时间 `due`，计算 `now` 时刻的触发计划
///
/// 超过 `misfire_grace_time` 的错过触发被放弃；`coalesce` 时仍在宽限期内的多次触发合并为一次。
pub fn plan_fires(job: &ScheduledJob, due: DateTime<Utc>, now: DateTime<Utc>) -> SchedulerResult<FirePlan> {
    if due > now {
        return Ok(FirePlan {
            fire_at: Vec::new(),
            misfired: 0,
            next_fire: Some(due),
        });
    }

    let due_times = expand_due_times(&job.schedule, due, now, now - job.misfire_grace())?;
    let fire_at: Vec<_> = if job.coalesce {
        due_times.on_time.back().copied().into_iter().collect()
    } else {
        due_times.on_time.into_iter().collect()
    };
    let misfired = if job.coalesce && fire_at.is_empty() {
        usize::from(due_times.late > 0)
    } else {
        due_times.late
    };

    Ok(FirePlan {
        fire_at,
        misfired,
        next_fire: due_times.next,
    })
}

/// `[due, now]` 内的触发时刻
struct DueTimes {
    /// 不早于宽限窗口起点的触发时刻，最多保留 `MAX_EXPANDED_FIRES` 个
    on_time: VecDeque<DateTime<Utc>>,
    /// 早于宽限窗口的次数，最多统计 `MAX_EXPANDED_FIRES` 次
    late: usize,
    /// `now` 之后的下一次
    next: Option<DateTime<Utc>>,
}

/// 展开触发时刻；宽限窗口之前的部分只计数，不逐个遍历
fn expand_due_times(
    schedule: &JobSchedule,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    window_start: DateTime<Utc>,
) -> SchedulerResult<DueTimes> {
    match schedule {
        JobSchedule::Interval(spec) => {
            let step_ms = spec.total_seconds().max(1) * 1000;
            let total = (now - due).num_milliseconds() / step_ms + 1;
            let late = if window_start > due {
                (((window_start - due).num_milliseconds() + step_ms - 1) / step_ms).min(total)
            } else {
                0
            };
            let first = late.max(total - MAX_EXPANDED_FIRES as i64);
            let on_time = (first..total)
                .map(|k| due + Duration::milliseconds(step_ms * k))
                .collect();
            Ok(DueTimes {
                on_time,
                late: (late as usize).min(MAX_EXPANDED_FIRES),
                next: Some(due + Duration::milliseconds(step_ms * total)),
            })
        }
        JobSchedule::Cron { expression } => {
            let cron = CronScheduler::new(expression)?;

            let mut late = 0;
            let mut candidate = Some(due);
            while let Some(time) = candidate {
                if time >= window_start || late == MAX_EXPANDED_FIRES {
                    break;
                }
                late += 1;
                candidate = cron.next_execution_time(time);
            }
            // 计数已满，直接跳到宽限窗口起点
            while let Some(time) = candidate {
                if time >= window_start {
                    break;
                }
                candidate = cron.next_execution_time(time.max(window_start - Duration::seconds(1)));
            }

            let mut on_time = VecDeque::new();
            while let Some(time) = candidate {
                if time > now {
                    break;
                }
                if on_time.len() == MAX_EXPANDED_FIRES {
                    on_time.pop_front();
                }
                on_time.push_back(time);
                candidate = cron.next_execution_time(time);
            }

            Ok(DueTimes {
                on_time,
                late,
                next: candidate,
            })
        }
    }
}

struct TimerEntry {
    job: ScheduledJob,
    next_fire: Option<DateTime<Utc>>,
}

pub struct TriggerEvaluator {
    service: Arc<SchedulerService>,
    jobs: Arc<dyn JobRepository>,
    changes: JobSetReceiver,
    config: SchedulerConfig,
    logger: ExecutionLogger,
    timers: HashMap<i64, TimerEntry>,
}

impl TriggerEvaluator {
    pub fn new(
        service: Arc<SchedulerService>,
        jobs: Arc<dyn JobRepository>,
        changes: JobSetReceiver,
        config: SchedulerConfig,
        logger: ExecutionLogger,
    ) -> Self {
        Self {
            service,
            jobs,
            changes,
            config,
            logger,
            timers: HashMap::new(),
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn next_fire(&self, job_id: i64) -> Option<DateTime<Utc>> {
        self.timers.get(&job_id).and_then(|entry| entry.next_fire)
    }

    /// 从存储重建定时器集合，调度参数未变的作业保留原有下次触发时间
    pub async fn sync(&mut self) -> SchedulerResult<()> {
        let jobs = self.jobs.timer_driven_jobs().await?;
        let mut timers = HashMap::with_capacity(jobs.len());
        for job in jobs {
            let entry = match self.timers.remove(&job.id) {
                Some(existing) if existing.job.schedule == job.schedule => TimerEntry {
                    next_fire: existing.next_fire,
                    job,
                },
                _ => self.new_entry(job),
            };
            timers.insert(entry.job.id, entry);
        }
        self.timers = timers;
        debug!(timers = self.timers.len(), "定时器集合已同步");
        Ok(())
    }

    fn new_entry(&self, job: ScheduledJob) -> TimerEntry {
        let next_fire = match initial_next_fire(&job) {
            Ok(next) => next,
            Err(e) => {
                warn!(job_id = job.id, "无法计算首次触发时间: {}", e);
                None
            }
        };
        TimerEntry { job, next_fire }
    }

    pub fn apply(&mut self, change: JobSetChange) {
        match change {
            JobSetChange::Upsert(job) if job.is_timer_driven() => {
                let entry = match self.timers.remove(&job.id) {
                    Some(existing) if existing.job.schedule == job.schedule => TimerEntry {
                        next_fire: existing.next_fire,
                        job,
                    },
                    _ => self.new_entry(job),
                };
                self.timers.insert(entry.job.id, entry);
            }
            JobSetChange::Upsert(job) => {
                self.timers.remove(&job.id);
            }
            JobSetChange::Remove(job_id) => {
                self.timers.remove(&job_id);
            }
        }
    }

    /// 评估所有到期定时器，返回发起的触发次数
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        let due_jobs: Vec<i64> = self
            .timers
            .values()
            .filter(|entry| entry.next_fire.is_some_and(|next| next <= now))
            .map(|entry| entry.job.id)
            .collect();

        for job_id in due_jobs {
            let Some(entry) = self.timers.get(&job_id) else {
                continue;
            };
            let Some(due) = entry.next_fire else {
                continue;
            };
            let job = entry.job.clone();
            let ctx = ExecutionContext::new()
                .with("job_id", job.id)
                .with("trigger_source", "SCHEDULED");

            let plan = match plan_fires(&job, due, now) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(job_id, "触发计划计算失败，移出定时器集合: {}", e);
                    self.timers.remove(&job_id);
                    continue;
                }
            };

            if plan.misfired > 0 {
                self.logger.warn(
                    &ctx,
                    LogEvent::MisfireSkipped,
                    format!(
                        "{} fire(s) missed beyond grace of {}s",
                        plan.misfired, job.misfire_grace_time
                    ),
                    None,
                );
            }

            for scheduled_at in &plan.fire_at {
                self.logger.info(
                    &ctx.child([("scheduled_at", json!(scheduled_at.to_rfc3339()))]),
                    LogEvent::TimerFired,
                    format!("timer fired for job {}", job.name),
                );
                match self.service.trigger_scheduled(job.id, *scheduled_at).await {
                    Ok(_) => fired += 1,
                    Err(e) if e.is_validation() => debug!(job_id, "定时触发被拒绝: {}", e),
                    Err(e) if e.is_not_found() => {
                        self.timers.remove(&job_id);
                        break;
                    }
                    Err(e) => warn!(job_id, "定时触发失败: {}", e),
                }
            }

            if let Some(entry) = self.timers.get_mut(&job_id) {
                entry.next_fire = plan.next_fire;
            }
        }
        fired
    }

    /// 评估循环，直到收到关闭信号
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        if let Err(e) = self.sync().await {
            warn!("初始同步作业集合失败: {}", e);
        }
        info!(timers = self.timers.len(), "触发评估器已启动");

        let mut tick_interval = interval(StdDuration::from_millis(self.config.tick_interval_ms));
        let mut sync_interval = interval(StdDuration::from_secs(self.config.sync_interval_seconds));
        sync_interval.tick().await;

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = sync_interval.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!("同步作业集合失败: {}", e);
                    }
                }
                Some(change) = self.changes.recv() => {
                    self.apply(change);
                }
                _ = shutdown_rx.recv() => {
                    info!("触发评估器退出");
                    break;
                }
            }
        }
    }
}
