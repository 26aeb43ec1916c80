//! 规则评估器
//!
//! `RuleEvaluator` 是各类规则的统一接口，`RuleRegistry` 负责按 `Rule::kind`
//! 找到对应实现。内置类型：
//! - `static_group`：主体是否（经组层级传递地）属于绑定的组
//! - `static_user`：主体是否为绑定的用户
//! - `fixed_result`：固定结果，可模拟延迟，用于测试与调试
//! - `expression`：表达式规则，见 [`crate::expression`]

use crate::context::EvaluationContext;
use crate::expression::ExpressionRule;
use crate::models::{Rule, kinds};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 单条规则的评估结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub passing: bool,
    pub message: Option<String>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            passing: true,
            message: None,
        }
    }

    pub fn fail() -> Self {
        Self {
            passing: false,
            message: None,
        }
    }

    pub fn from_bool(passing: bool) -> Self {
        Self {
            passing,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// 规则执行失败
///
/// 描述原样作为绑定消息上报，不加任何前缀。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EvaluationError {
    message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 规则评估器接口
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    /// 处理的规则类型
    fn kind(&self) -> &'static str;

    /// 类型说明，用于列出可用规则类型
    fn description(&self) -> &'static str;

    /// 评估规则
    async fn evaluate(
        &self,
        rule: &Rule,
        context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError>;
}

/// 解析规则配置，格式错误作为评估失败上报
pub fn parse_config<T: DeserializeOwned>(rule: &Rule) -> Result<T, EvaluationError> {
    serde_json::from_value(rule.config.clone())
        .map_err(|e| EvaluationError::new(format!("invalid {} configuration: {}", rule.kind, e)))
}

/// 规则类型说明
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleKindInfo {
    pub kind: &'static str,
    pub description: &'static str,
}

/// 规则类型注册表
#[derive(Clone)]
pub struct RuleRegistry {
    evaluators: HashMap<String, Arc<dyn RuleEvaluator>>,
}

impl RuleRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// 注册全部内置规则类型
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(StaticGroupRule));
        registry.register(Arc::new(StaticUserRule));
        registry.register(Arc::new(FixedResultRule));
        registry.register(Arc::new(ExpressionRule::new()));
        registry
    }

    /// 注册评估器，同类型已存在时覆盖
    pub fn register(&mut self, evaluator: Arc<dyn RuleEvaluator>) -> &mut Self {
        self.evaluators
            .insert(evaluator.kind().to_string(), evaluator);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn RuleEvaluator>> {
        self.evaluators.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.evaluators.contains_key(kind)
    }

    /// 列出所有已注册的规则类型（按名称排序）
    pub fn kinds(&self) -> Vec<RuleKindInfo> {
        let mut kinds: Vec<RuleKindInfo> = self
            .evaluators
            .values()
            .map(|e| RuleKindInfo {
                kind: e.kind(),
                description: e.description(),
            })
            .collect();
        kinds.sort_by_key(|k| k.kind);
        kinds
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ============================================================================
// 内置规则
// ============================================================================

#[derive(Deserialize)]
struct StaticGroupConfig {
    group: Uuid,
}

/// 静态组规则
pub struct StaticGroupRule;

#[async_trait]
impl RuleEvaluator for StaticGroupRule {
    fn kind(&self) -> &'static str {
        kinds::STATIC_GROUP
    }

    fn description(&self) -> &'static str {
        "Passes if the user is a member of the group or of one of its descendants"
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError> {
        let config: StaticGroupConfig = parse_config(rule)?;
        Ok(RuleOutcome::from_bool(
            context.membership().is_member(config.group),
        ))
    }
}

#[derive(Deserialize)]
struct StaticUserConfig {
    user: Uuid,
}

/// 静态用户规则
pub struct StaticUserRule;

#[async_trait]
impl RuleEvaluator for StaticUserRule {
    fn kind(&self) -> &'static str {
        kinds::STATIC_USER
    }

    fn description(&self) -> &'static str {
        "Passes if the requesting user is the bound user"
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError> {
        let config: StaticUserConfig = parse_config(rule)?;
        Ok(RuleOutcome::from_bool(
            context.principal().id == config.user,
        ))
    }
}

fn default_fixed_message() -> Option<String> {
    Some("dummy".to_string())
}

#[derive(Deserialize)]
struct FixedResultConfig {
    #[serde(default)]
    result: bool,
    /// 模拟延迟下限（毫秒）
    #[serde(default)]
    wait_min_ms: u64,
    /// 模拟延迟上限（毫秒）
    #[serde(default)]
    wait_max_ms: u64,
    #[serde(default = "default_fixed_message")]
    message: Option<String>,
}

/// 固定结果规则
pub struct FixedResultRule;

#[async_trait]
impl RuleEvaluator for FixedResultRule {
    fn kind(&self) -> &'static str {
        kinds::FIXED_RESULT
    }

    fn description(&self) -> &'static str {
        "Returns a configured result after an optional random delay, for testing"
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        _context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError> {
        let config: FixedResultConfig = parse_config(rule)?;
        if config.wait_max_ms < config.wait_min_ms {
            return Err(EvaluationError::new(format!(
                "wait_max_ms ({}) is lower than wait_min_ms ({})",
                config.wait_max_ms, config.wait_min_ms
            )));
        }

        if config.wait_max_ms > 0 {
            let wait = rand::rng().random_range(config.wait_min_ms..=config.wait_max_ms);
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }

        Ok(RuleOutcome {
            passing: config.result,
            message: config.message,
        })
    }
}
