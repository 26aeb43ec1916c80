//! CLI 命令定义
//!
//! 使用 clap derive 宏定义命令行接口结构。

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// 策略引擎命令行工具
///
/// 使用 `--help` 查看各子命令的详细说明。
#[derive(Parser, Debug)]
#[command(name = "policy-engine")]
#[command(version, about = "策略评估引擎")]
#[command(propagate_version = true)]
pub struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// 子命令枚举
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 执行一次策略评估并输出 JSON 结果
    ///
    /// 指定 `--fixture` 时从 JSON 文件加载数据，否则连接配置中的数据库。
    Check {
        /// fixture 文件路径（JSON）
        #[arg(short, long)]
        fixture: Option<PathBuf>,

        /// 目标 ID
        #[arg(short, long)]
        target: Option<Uuid>,

        /// 主体 ID
        #[arg(short, long)]
        principal: Option<Uuid>,

        /// 不读写结果缓存
        #[arg(long)]
        no_cache: bool,

        /// 调试模式，输出每条绑定的执行明细
        #[arg(long)]
        debug: bool,

        /// 附加上下文（JSON 对象）
        #[arg(short, long)]
        context: Option<String>,

        /// 会话标识，参与缓存键计算
        #[arg(long)]
        session: Option<String>,
    },

    /// 以调试模式测试单条规则
    TestRule {
        /// fixture 文件路径（JSON）
        #[arg(short, long)]
        fixture: PathBuf,

        /// 规则 ID
        #[arg(short, long)]
        rule: Uuid,

        /// 主体 ID
        #[arg(short, long)]
        principal: Uuid,

        /// 附加上下文（JSON 对象）
        #[arg(short, long)]
        context: Option<String>,

        /// 原始请求信息（JSON，如 {"remote_ip": "10.0.0.1"}）
        #[arg(long)]
        request: Option<String>,
    },

    /// 列出已注册的规则类型
    Kinds,

    /// 统计缓存中的策略结果数量
    CacheInfo,

    /// 清空策略结果与应用可见性缓存
    CacheClear,

    /// 执行数据库迁移
    Migrate,
}

// ============================================================================
// 单元测试
// ============================================================================
