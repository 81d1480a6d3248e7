//! 配置管理
//!
//! 配置按 默认值 → TOML 文件 → `ORCHESTRATOR__` 环境变量 的顺序合并，
//! 每个子配置各自提供 `validate`，由 [`AppConfig::validate`] 统一调用。

pub mod models;

pub use models::*;
