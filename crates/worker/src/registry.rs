use std::collections::BTreeMap;
use std::sync::Arc;

use scheduler_domain::{repositories::ExecutionRepository, value_objects::NewTaskFunction};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::info;

use crate::handler::TaskHandler;
use crate::handlers::{DataReplicationHandler, HistoryCleanupHandler, HttpRequestHandler};

/// 启动时构建的任务注册表，键在作业创建时校验
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置处理器：历史清理、数据复制、HTTP请求
    pub fn with_builtins(executions: Arc<dyn ExecutionRepository>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HistoryCleanupHandler::new(executions)));
        registry.register(Arc::new(DataReplicationHandler));
        registry.register(Arc::new(HttpRequestHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        info!(key = handler.key(), "注册任务处理器");
        self.handlers.insert(handler.key().to_string(), handler);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn ensure_registered(&self, key: &str) -> SchedulerResult<()> {
        if self.contains(key) {
            Ok(())
        } else {
            Err(SchedulerError::validation_error(format!(
                "task function '{key}' has no registered handler"
            )))
        }
    }

    /// 用于写入 task_functions 表的描述
    pub fn task_functions(&self) -> Vec<NewTaskFunction> {
        self.handlers
            .values()
            .map(|handler| {
                let descriptor = handler.descriptor();
                NewTaskFunction {
                    key: handler.key().to_string(),
                    implementation: handler.key().to_string(),
                    version: descriptor.version,
                    name_en: descriptor.name_en,
                    name_ar: descriptor.name_ar,
                    description: descriptor.description,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{AttemptContext, HandlerDescriptor, TaskOutput};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn key(&self) -> &'static str {
            "echo"
        }

        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor {
                version: 2,
                name_en: "Echo".to_string(),
                name_ar: "صدى".to_string(),
                description: None,
            }
        }

        async fn run(&self, _attempt: &AttemptContext<'_>) -> anyhow::Result<TaskOutput> {
            Ok(TaskOutput::new("echo"))
        }
    }

    #[test]
    fn test_registry_lookup_and_descriptors() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert!(registry.ensure_registered("missing").unwrap_err().is_validation());

        let functions = registry.task_functions();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].key, "echo");
        assert_eq!(functions[0].version, 2);
    }
}
