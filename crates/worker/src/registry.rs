use std::collections::HashMap;
use std::sync::Arc;

use orchestrator_core::{JobHandler, OrchestratorError, OrchestratorResult};
use serde_json::Value;
use tracing::info;

use crate::executors::{EchoWorker, FailingWorker, HttpWorker, ShellWorker};

/// 由Worker参数构造处理器
pub type WorkerConstructor = fn(&Value) -> anyhow::Result<Arc<dyn JobHandler>>;

/// 编译期已知的Worker类名到构造函数的映射
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    constructors: HashMap<String, WorkerConstructor>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置Worker：echo、shell、http、failing
    pub fn with_builtin_workers() -> Self {
        let mut registry = Self::new();
        registry
            .register("echo", EchoWorker::build)
            .register("shell", ShellWorker::build)
            .register("http", HttpWorker::build)
            .register("failing", FailingWorker::build);
        registry
    }

    pub fn register(&mut self, worker_class: impl Into<String>, constructor: WorkerConstructor) -> &mut Self {
        self.constructors.insert(worker_class.into(), constructor);
        self
    }

    pub fn contains(&self, worker_class: &str) -> bool {
        self.constructors.contains_key(worker_class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.constructors.keys().cloned().collect();
        classes.sort();
        classes
    }

    /// 按类名和参数构造处理器
    pub fn create(&self, worker_class: &str, params: &Value) -> OrchestratorResult<Arc<dyn JobHandler>> {
        let constructor = self.constructors.get(worker_class).ok_or_else(|| {
            OrchestratorError::WorkerLaunch(format!(
                "未知的Worker类: {worker_class}，可用: {}",
                self.classes().join(", ")
            ))
        })?;
        let handler = constructor(params).map_err(|e| {
            OrchestratorError::WorkerLaunch(format!("构造Worker {worker_class} 失败: {e:#}"))
        })?;
        info!("Worker处理器已创建: class={}", worker_class);
        Ok(handler)
    }
}
