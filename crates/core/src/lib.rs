pub mod config;
pub mod logging;

pub use config::models::{
    AppConfig, CleanupConfig, DatabaseConfig, DispatchConfig, DispatchStrategyKind, HeartbeatConfig,
    LockConfig, ObservabilityConfig, SchedulerConfig,
};
pub use logging::{
    init_logging, ExecutionContext, ExecutionLogger, LogEvent, LogRecord, LogSink, MemorySink,
    Severity, TracingSink,
};
