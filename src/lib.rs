//! 分布式作业编排系统
//!
//! 单个二进制按子命令运行集群管理器、节点代理、单个Worker，或在同一进程中
//! 同时运行管理器与节点代理。

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application, WorkerOptions};
pub use shutdown::ShutdownManager;
