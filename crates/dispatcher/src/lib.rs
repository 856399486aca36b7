//! 调度服务、触发协议与分布式锁
//!
//! 多个实例各自评估定时器，只在执行时通过作业级锁协调。

pub mod cleanup;
pub mod cron_utils;
pub mod instance_registry;
pub mod launcher;
pub mod lock_manager;
pub mod node;
pub mod scheduler_service;
pub mod trigger_evaluator;

pub use cleanup::CleanupService;
pub use cron_utils::CronScheduler;
pub use instance_registry::InstanceRegistry;
pub use launcher::Launcher;
pub use lock_manager::LockManager;
pub use node::{SchedulerNode, SchedulerNodeBuilder};
pub use scheduler_service::{NextRun, SchedulerService, SchedulerStatus};
pub use trigger_evaluator::{job_set_channel, FirePlan, JobSetChange, TriggerEvaluator};
