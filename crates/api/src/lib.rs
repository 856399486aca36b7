//! # Scheduler API
//!
//! 供外部HTTP层调用的类型化接口：作业生命周期、执行历史、调度状态、数据清理和参考数据。
//! 路由、认证与请求校验不在本crate内。
//!
//! ## 接口
//!
//! - 作业：按间隔创建、按CRON创建、统一创建、查询、分页列表、更新、软删除
//! - 动作：`{enable, disable, trigger, pause, resume}`，返回 `{success, message, executionId?, job?}`
//! - 历史：单个作业或全局，按状态与时间范围过滤
//! - 状态：作业计数、存活实例、最近一次计划触发、最近执行
//! - 清理：`{retentionDays}` → 各表删除行数
//! - 参考数据：任务函数、作业类型、执行状态

pub mod dto;
pub mod error;
pub mod facade;
pub mod response;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use facade::SchedulerApi;
pub use response::{ApiResponse, PaginatedResponse};
