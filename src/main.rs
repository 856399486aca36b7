use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scheduler_api::{
    dto::{CleanupRequest, HistoryQuery, JobAction, JobActionRequest},
    SchedulerApi,
};
use scheduler_core::{init_logging, AppConfig};
use scheduler_dispatcher::{SchedulerNode, SchedulerService};
use scheduler_domain::entities::InstanceMode;
use serde::Serialize;
use tracing::info;

mod shutdown;

use shutdown::wait_for_shutdown_signal;

/// 作业调度与执行控制
#[derive(Parser, Debug)]
#[command(name = "scheduler")]
#[command(version = "1.0.0")]
#[command(about = "分布式作业调度与执行控制核心")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径，缺省时依次查找 config/scheduler.toml 与 scheduler.toml
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 覆盖配置中的日志级别
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动调度节点，直到收到关闭信号
    Run {
        #[arg(short, long, value_enum)]
        mode: Option<RunMode>,
        /// 实例名称
        #[arg(long)]
        instance_name: Option<String>,
    },
    /// 立即触发一个作业并等待执行结束
    Trigger {
        job_id: i64,
        /// 操作用户ID
        #[arg(long)]
        user_id: Option<i64>,
    },
    /// 查看调度器状态
    Status,
    /// 查看执行历史
    History {
        /// 只看某个作业
        #[arg(long)]
        job_id: Option<i64>,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// 清理超期数据
    Cleanup {
        #[arg(long)]
        retention_days: Option<i64>,
    },
    /// 校验并打印生效配置
    CheckConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RunMode {
    Embedded,
    Standalone,
}

impl From<RunMode> for InstanceMode {
    fn from(mode: RunMode) -> Self {
        match mode {
            RunMode::Embedded => InstanceMode::Embedded,
            RunMode::Standalone => InstanceMode::Standalone,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
        config.validate()?;
    }
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    match cli.command {
        Commands::Run {
            mode,
            instance_name,
        } => run(config, mode, instance_name).await,
        Commands::Trigger { job_id, user_id } => {
            with_api(config, |api, service| async move {
                let response = api
                    .job_action(
                        job_id,
                        JobActionRequest {
                            action: JobAction::Trigger,
                            user_id,
                        },
                    )
                    .await?;
                let Some(execution_id) = response.execution_id else {
                    print_json(&response)?;
                    return Ok(());
                };
                service.launcher().wait_idle().await;
                print_json(&api.get_execution(execution_id).await?)
            })
            .await
        }
        Commands::Status => {
            with_api(config, |api, _service| async move { print_json(&api.status().await?) }).await
        }
        Commands::History { job_id, limit } => {
            with_api(config, |api, _service| async move {
                let query = HistoryQuery {
                    page_size: Some(limit),
                    ..HistoryQuery::default()
                };
                let page = match job_id {
                    Some(job_id) => api.job_history(job_id, query).await?,
                    None => api.history(query).await?,
                };
                print_json(&page)
            })
            .await
        }
        Commands::Cleanup { retention_days } => {
            let retention_days = retention_days.unwrap_or(config.cleanup.retention_days);
            with_api(config, |api, _service| async move {
                print_json(&api.cleanup(CleanupRequest { retention_days }).await?)
            })
            .await
        }
        Commands::CheckConfig => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(
    mut config: AppConfig,
    mode: Option<RunMode>,
    instance_name: Option<String>,
) -> Result<()> {
    if instance_name.is_some() {
        config.scheduler.instance_name = instance_name;
    }
    let mut builder = SchedulerNode::builder(config);
    if let Some(mode) = mode {
        builder = builder.mode(mode.into());
    }
    let node = builder.start().await?;
    info!(instance_id = node.instance_id(), "调度节点运行中，等待关闭信号");

    wait_for_shutdown_signal().await;
    node.shutdown().await?;
    Ok(())
}

/// 以不启动定时器的节点执行一次性命令
async fn with_api<F, Fut>(config: AppConfig, command: F) -> Result<()>
where
    F: FnOnce(SchedulerApi, Arc<SchedulerService>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let node = SchedulerNode::builder(config).without_timers().start().await?;
    let api = SchedulerApi::new(node.service());
    let result = command(api, node.service()).await;
    node.shutdown().await?;
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
