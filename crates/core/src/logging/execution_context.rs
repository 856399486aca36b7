//! 显式传递的执行上下文
//!
//! 关联ID在入站请求/触发时设置一次，之后随上下文对象穿过每个函数边界；
//! 上下文字段在跨组件时只增不减，子上下文共享同一个计时起点。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Timing {
    started_at: Option<DateTime<Utc>>,
    last_entry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    correlation_id: String,
    fields: BTreeMap<String, Value>,
    timing: Arc<Mutex<Timing>>,
}

impl ExecutionContext {
    /// 新的入站请求或触发，生成新的关联ID
    pub fn new() -> Self {
        Self::with_correlation_id(Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            fields: BTreeMap::new(),
            timing: Arc::new(Mutex::new(Timing::default())),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// 跨组件边界：继承关联ID与计时，叠加新字段
    pub fn child<I, K>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut child = self.clone();
        for (key, value) in extra {
            child.fields.insert(key.into(), value);
        }
        child
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timing.lock().ok().and_then(|timing| timing.started_at)
    }

    /// 记录一条日志的时间点，返回 (delta_ms, total_duration_ms)
    pub(crate) fn mark(&self, now: DateTime<Utc>) -> (Option<i64>, Option<i64>) {
        let Ok(mut timing) = self.timing.lock() else {
            return (None, None);
        };
        let started_at = *timing.started_at.get_or_insert(now);
        let delta = timing
            .last_entry_at
            .map(|last| (now - last).num_milliseconds().max(0));
        timing.last_entry_at = Some(now);
        (delta, Some((now - started_at).num_milliseconds().max(0)))
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
