use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 执行策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategyKind {
    /// 在调用方运行时上派生异步任务
    InProcess,
    /// 提交到独立线程池，每个线程拥有自己的运行时
    WorkerPool,
}

/// 调度/重试层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 软时限：到期后通知处理器尽快收尾
    pub soft_time_limit_seconds: u64,
    /// 硬时限：到期后强制中止本次尝试
    pub hard_time_limit_seconds: u64,
    pub strategy: DispatchStrategyKind,
    pub worker_threads: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            soft_time_limit_seconds: 300,
            hard_time_limit_seconds: 360,
            strategy: DispatchStrategyKind::InProcess,
            worker_threads: 4,
        }
    }
}

impl DispatchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_seconds)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("指数退避倍数必须不小于1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动因子必须在0.0-1.0之间"));
        }
        if self.hard_time_limit_seconds == 0 {
            return Err(anyhow::anyhow!("硬时限必须大于0"));
        }
        if self.soft_time_limit_seconds > self.hard_time_limit_seconds {
            return Err(anyhow::anyhow!("软时限不能大于硬时限"));
        }
        if self.strategy == DispatchStrategyKind::WorkerPool && self.worker_threads == 0 {
            return Err(anyhow::anyhow!("线程池模式下工作线程数必须大于0"));
        }
        Ok(())
    }
}
