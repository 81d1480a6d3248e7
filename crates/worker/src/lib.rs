//! # Orchestrator Worker
//!
//! Worker运行时：作业模式校验与发布、带重试/死信的消费循环、
//! Worker类注册表与内置Worker，以及单个Worker的HTTP服务。

pub mod consumer;
pub mod executors;
pub mod producer;
pub mod registry;
pub mod retry_policy;
pub mod schema;
pub mod server;

pub use consumer::{ConsumeStats, Consumer, ProcessOutcome};
pub use executors::{EchoWorker, FailingWorker, HttpWorker, ShellWorker};
pub use producer::JobProducer;
pub use registry::{WorkerConstructor, WorkerRegistry};
pub use retry_policy::RetryPolicy;
pub use schema::SchemaRegistry;
pub use server::WorkerServer;
