use std::time::Duration;

use scheduler_core::config::models::DispatchConfig;

/// 重试策略：有界次数、指数退避加随机抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次尝试之外的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn should_retry(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.max_attempts()
    }

    /// 第 `failed_attempt` 次尝试失败后的等待时间（从1开始计数）
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        let exponential = base * self.backoff_multiplier.powi(exponent);
        let capped = exponential.min(max);

        // 添加随机抖动以避免雷群效应
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let delay = (capped + jitter).clamp(base, max.max(base));

        Duration::from_secs_f64(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_factor: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = policy(0.0);
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
