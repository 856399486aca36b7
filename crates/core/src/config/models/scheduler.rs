use serde::{Deserialize, Serialize};

/// 调度实例配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// embedded 或 standalone
    pub mode: String,
    /// 为空时由主机名和进程号生成
    pub instance_name: Option<String>,
    /// 定时器评估周期（毫秒）
    pub tick_interval_ms: u64,
    /// 从存储重新同步作业集合的周期（秒）
    pub sync_interval_seconds: u64,
    /// 关闭时等待在途执行的最长时间（秒）
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: "standalone".to_string(),
            instance_name: None,
            tick_interval_ms: 1000,
            sync_interval_seconds: 30,
            shutdown_grace_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !["embedded", "standalone"].contains(&self.mode.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的运行模式: {}，支持: embedded, standalone",
                self.mode
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("定时器评估周期必须大于0"));
        }
        if self.sync_interval_seconds == 0 {
            return Err(anyhow::anyhow!("作业同步周期必须大于0"));
        }
        Ok(())
    }
}

/// 实例心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
    /// 超过该时长未刷新心跳的实例视为失联
    pub staleness_threshold_seconds: i64,
    /// 心跳陈旧超过 阈值×N 的实例记录在清理时删除
    pub instance_retention_multiplier: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 15,
            staleness_threshold_seconds: 60,
            instance_retention_multiplier: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_threshold_seconds)
    }

    pub fn instance_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_threshold_seconds * self.instance_retention_multiplier)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.staleness_threshold_seconds <= self.interval_seconds as i64 {
            return Err(anyhow::anyhow!("心跳陈旧阈值必须大于心跳间隔"));
        }
        if self.instance_retention_multiplier < 1 {
            return Err(anyhow::anyhow!("实例保留倍数必须至少为1"));
        }
        Ok(())
    }
}

/// 分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// 锁TTL取 max(misfire_grace_time, min_ttl_seconds)
    pub min_ttl_seconds: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            min_ttl_seconds: 30,
        }
    }
}

impl LockConfig {
    pub fn ttl_for(&self, misfire_grace_time: i32) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(misfire_grace_time).max(self.min_ttl_seconds))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_ttl_seconds <= 0 {
            return Err(anyhow::anyhow!("锁最小TTL必须大于0"));
        }
        Ok(())
    }
}
