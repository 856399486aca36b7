//! 任务派发与重试层
//!
//! 处理器在启动时注册；每次执行经 [`RetryingDispatcher`] 包装，
//! 按策略重试、限时并在每次尝试后释放作用域资源。

pub mod attempt_scope;
pub mod handler;
pub mod handlers;
pub mod registry;
pub mod retry;
pub mod retrying_dispatcher;
pub mod strategy;

pub use attempt_scope::AttemptScope;
pub use handler::{AttemptContext, HandlerDescriptor, TaskHandler, TaskOutput};
pub use registry::TaskRegistry;
pub use retry::RetryPolicy;
pub use retrying_dispatcher::{DispatchJob, RetryingDispatcher, TimeLimits};
pub use strategy::{ExecutionStrategy, WorkerPool};
