//! # 数据模型
//!
//! 作业编排核心的数据结构：作业消息信封、死信记录、队列描述、
//! Worker类型/实例以及节点注册信息。
//!
//! ## Worker实例状态流转
//! ```text
//! Starting → Available → Down
//!     └──────────────────↑
//! ```
//! 端口只在进入 `Down` 时释放。
//!
//! ## 消息状态流转（消费端）
//! ```text
//! Received → Processing → Acked
//!                       → Requeued (retry_count + 1)
//!                       → DeadLettered
//! ```

pub mod dead_letter;
pub mod job;
pub mod queue;
pub mod worker;

pub use dead_letter::*;
pub use job::*;
pub use queue::*;
pub use worker::*;
