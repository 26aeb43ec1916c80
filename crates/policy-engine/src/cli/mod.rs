//! CLI 模块
//!
//! 提供命令行接口，支持以下功能：
//!
//! - `check` - 对目标与主体执行一次策略评估
//! - `test-rule` - 以调试模式测试单条规则
//! - `kinds` - 列出已注册的规则类型
//! - `cache-info` / `cache-clear` - 查看或清空结果缓存
//! - `migrate` - 执行数据库迁移
//!
//! # 使用示例
//!
//! ```bash
//! # 使用 fixture 评估（省略 target/principal 时取 fixture 中的第一个）
//! policy-engine check --fixture policies.json --debug
//!
//! # 使用数据库评估
//! policy-engine check --target <uuid> --principal <uuid>
//!
//! # 测试单条规则
//! policy-engine test-rule --fixture policies.json --rule <uuid> --principal <uuid> \
//!     --context '{"amount": 10}' --request '{"remote_ip": "10.0.0.1"}'
//!
//! # 清空缓存
//! policy-engine cache-clear
//! ```

pub mod commands;
pub mod runner;

pub use commands::{Cli, Commands};
pub use runner::CommandRunner;
