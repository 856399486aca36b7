use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use scheduler_domain::value_objects::JobSchedule;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 接受标准5段表达式（分 时 日 月 周），内部补齐秒字段；6/7段原样交给 `cron`。
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { schedule })
    }

    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }

    /// `from` 之后（不含）的下一次触发时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

fn normalize(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// 调度参数的下一次触发时间
pub fn next_fire_time(schedule: &JobSchedule, after: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
    match schedule {
        JobSchedule::Interval(spec) => Ok(Some(after + spec.as_duration())),
        JobSchedule::Cron { expression } => {
            Ok(CronScheduler::new(expression)?.next_execution_time(after))
        }
    }
}

/// 校验调度参数本身（CRON可解析、间隔为正）
pub fn validate_schedule(schedule: &JobSchedule) -> SchedulerResult<()> {
    match schedule {
        JobSchedule::Interval(spec) => spec.validate(),
        JobSchedule::Cron { expression } => CronScheduler::validate_cron_expression(expression),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scheduler_domain::value_objects::IntervalSpec;

    #[test]
    fn test_five_field_expressions_are_accepted() {
        let scheduler = CronScheduler::new("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
        assert_eq!(
            scheduler.next_execution_time(from),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap())
        );
        assert!(CronScheduler::new("0 0 * * * *").is_ok());
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = CronScheduler::new("not a cron").err().unwrap();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
        assert!(validate_schedule(&JobSchedule::Cron {
            expression: "61 * * * *".to_string()
        })
        .is_err());
    }

    #[test]
    fn test_interval_next_fire() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = next_fire_time(&JobSchedule::Interval(IntervalSpec::hours(4)), from)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap());
    }
}
