//! 表达式规则
//!
//! 类 Python 的小型表达式语言，只读访问评估上下文：
//!
//! ```text
//! ak_message("需要管理员权限")
//! return "admins" in request.user.groups and context.amount < 1000
//! ```
//!
//! 可用变量：
//! - `request`：`{user, context, http, debug}`，其中 `request.user.groups` 为有效组名列表
//! - `context`：调用方传入的附加上下文（`request.context` 的简写）
//!
//! 可用函数：`ak_message`、`len`、`lower`、`upper`、`str`、`bool`、`regex_match`。
//!
//! 语句以换行或 `;` 分隔，`return` 提前结束；结果取返回值（或最后一条语句的值）的真值。

mod interpreter;
mod lexer;
mod parser;

pub use interpreter::{Evaluation, Value};
pub use parser::{Program, parse};

use crate::context::EvaluationContext;
use crate::evaluator::{EvaluationError, RuleEvaluator, RuleOutcome, parse_config};
use crate::models::{Rule, kinds};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 编译缓存容量上限，超出后整体清空
const MAX_COMPILED: usize = 1024;

#[derive(Deserialize)]
struct ExpressionConfig {
    expression: String,
}

/// 求值单个表达式，返回原始求值结果
pub fn evaluate(source: &str, context: &EvaluationContext) -> Result<Evaluation, EvaluationError> {
    let program = parse(source)?;
    interpreter::run(&program, &globals(context))
}

fn globals(context: &EvaluationContext) -> HashMap<String, Value> {
    let request = Value::from(&context.to_value());
    let extra = Value::from(&serde_json::Value::Object(context.extra().clone()));

    let mut globals = HashMap::new();
    globals.insert("request".to_string(), request);
    globals.insert("context".to_string(), extra);
    globals
}

/// 表达式规则评估器，按源码缓存解析结果
#[derive(Default)]
pub struct ExpressionRule {
    compiled: DashMap<String, Arc<Program>>,
}

impl ExpressionRule {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&self, source: &str) -> Result<Arc<Program>, EvaluationError> {
        if let Some(program) = self.compiled.get(source) {
            return Ok(Arc::clone(program.value()));
        }

        let program = Arc::new(parse(source)?);
        if self.compiled.len() >= MAX_COMPILED {
            debug!("表达式编译缓存已满，清空");
            self.compiled.clear();
        }
        self.compiled
            .insert(source.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// 已缓存的表达式数量
    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }
}

#[async_trait]
impl RuleEvaluator for ExpressionRule {
    fn kind(&self) -> &'static str {
        kinds::EXPRESSION
    }

    fn description(&self) -> &'static str {
        "Evaluates an expression against the request; passes if the result is truthy"
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError> {
        let config: ExpressionConfig = parse_config(rule)?;
        let program = self.compile(&config.expression)?;
        let evaluation = interpreter::run(&program, &globals(context))?;

        let outcome = RuleOutcome::from_bool(evaluation.result.truthy());
        if evaluation.messages.is_empty() {
            Ok(outcome)
        } else {
            Ok(outcome.with_message(evaluation.messages.join(", ")))
        }
    }
}
