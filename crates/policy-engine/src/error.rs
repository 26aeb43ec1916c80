//! 策略引擎错误类型
//!
//! 这里只包含会中止整个评估的错误。单条规则的运行时失败由
//! [`crate::evaluator::EvaluationError`] 表示，并在绑定级别被吸收。

use policy_shared::error::SharedError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("未知的规则类型: binding={binding} kind={kind}")]
    UnknownRuleType { binding: Uuid, kind: String },

    #[error("无效的绑定 {binding}: {reason}")]
    InvalidBinding { binding: Uuid, reason: String },

    #[error("对象未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("策略数据读取失败: {0}")]
    Repository(String),

    #[error("缓存错误: {0}")]
    Cache(#[from] SharedError),

    #[error("引擎已开始评估，输入不可再修改")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownRuleType { .. } => "UNKNOWN_RULE_TYPE",
            Self::InvalidBinding { .. } => "INVALID_BINDING",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::AlreadyStarted => "ALREADY_STARTED",
        }
    }

    /// 是否为绑定解析阶段的致命错误
    ///
    /// 超时不在此列，单条绑定与引擎总时限都按 failure_result 记入结果。
    /// 致命错误发生时不会产生任何部分结果，调用方应将决策视为拒绝。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownRuleType { .. } | Self::InvalidBinding { .. } | Self::Repository(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Repository(err.to_string())
    }
}
