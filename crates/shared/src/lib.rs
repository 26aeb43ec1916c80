//! 共享库
//!
//! 包含策略引擎及其命令行工具共用的配置、错误处理、缓存与可观测性基础设施代码。

pub mod cache;
pub mod config;
pub mod error;
pub mod observability;
