pub mod app_config;
pub mod database;
pub mod dispatch;
pub mod observability;
pub mod scheduler;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatch::{DispatchConfig, DispatchStrategyKind};
pub use observability::{CleanupConfig, ObservabilityConfig};
pub use scheduler::{HeartbeatConfig, LockConfig, SchedulerConfig};
