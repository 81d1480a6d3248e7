//! # Orchestrator Node
//!
//! 节点代理：按集群管理器的指令启动、监督和终止本机上的Worker，
//! 并通过心跳与崩溃上报让管理器保持端口分配的准确性。

pub mod agent;
pub mod heartbeat;
pub mod launcher;

pub use agent::NodeAgent;
pub use heartbeat::HeartbeatManager;
pub use launcher::{
    wait_until_healthy, InProcessLauncher, SubprocessLauncher, WorkerLauncher, WorkerProcess,
};
