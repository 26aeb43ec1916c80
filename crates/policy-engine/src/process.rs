//! 单条绑定的执行流程
//!
//! 读缓存 → 评估（带超时）→ 失败转换为 failure_result → 写缓存 → 应用 negate。
//! 缓存中保存未经 negate 的原始结果，negate 在读取时应用。

use crate::cache::{ResultCache, cache_key};
use crate::context::EvaluationContext;
use crate::models::OutcomeRecord;
use crate::resolver::ResolvedBinding;
use chrono::{DateTime, Utc};
use policy_shared::observability::metrics::record_binding_evaluation;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 超时时使用的错误描述
pub const TIMEOUT_MESSAGE: &str = "policy evaluation timed out";

/// 执行日志条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub attributes: Value,
}

impl LogEntry {
    fn new(event: impl Into<String>, attributes: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            attributes,
        }
    }
}

/// 单条绑定的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct BindingOutput {
    pub binding_id: Uuid,
    pub rule_id: Uuid,
    pub kind: String,
    /// 应用 negate 后的结果
    pub outcome: OutcomeRecord,
    /// 未启用缓存时为 None
    pub cache_hit: Option<bool>,
    pub duration_ms: u64,
    pub log: Vec<LogEntry>,
}

/// 单条绑定的执行器
pub struct BindingProcess {
    resolved: ResolvedBinding,
    context: Arc<EvaluationContext>,
    cache: Option<ResultCache>,
    /// 是否收集执行日志
    capture_log: bool,
}

impl BindingProcess {
    pub fn new(resolved: ResolvedBinding, context: Arc<EvaluationContext>) -> Self {
        Self {
            resolved,
            context,
            cache: None,
            capture_log: false,
        }
    }

    pub fn with_cache(mut self, cache: Option<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    /// 收集执行日志
    pub fn with_log(mut self) -> Self {
        self.capture_log = true;
        self
    }

    pub fn binding_id(&self) -> Uuid {
        self.resolved.binding.id
    }

    pub fn failure_result(&self) -> bool {
        self.resolved.binding.failure_result
    }

    pub fn negate(&self) -> bool {
        self.resolved.binding.negate
    }

    pub fn rule_id(&self) -> Uuid {
        self.resolved.rule.id
    }

    pub fn kind(&self) -> &str {
        &self.resolved.rule.kind
    }

    /// 执行未能返回结果（任务崩溃或超出总时限）时的替代输出
    pub fn fallback(
        binding_id: Uuid,
        rule_id: Uuid,
        kind: String,
        failure_result: bool,
        negate: bool,
        error: &str,
    ) -> BindingOutput {
        record_binding_evaluation(&kind, None, true);
        BindingOutput {
            binding_id,
            rule_id,
            kind,
            outcome: OutcomeRecord::failed(failure_result, error).apply_negate(negate),
            cache_hit: None,
            duration_ms: 0,
            log: Vec::new(),
        }
    }

    fn logging_enabled(&self) -> bool {
        self.capture_log || self.context.debug() || self.resolved.rule.execution_logging
    }

    /// 执行绑定
    pub async fn execute(self) -> BindingOutput {
        let start = Instant::now();
        let ResolvedBinding {
            binding,
            rule,
            evaluator,
        } = &self.resolved;
        let logging = self.logging_enabled();
        let mut log = Vec::new();

        let key = self
            .cache
            .as_ref()
            .map(|_| cache_key(binding.id, rule.id, &self.context));

        let cached = match (&self.cache, &key) {
            (Some(cache), Some(key)) => cache.get(key).await,
            _ => None,
        };
        let cache_hit = self.cache.as_ref().map(|_| cached.is_some());

        let raw = match cached {
            Some(record) => {
                debug!(binding_id = %binding.id, "策略结果命中缓存");
                if logging {
                    log.push(LogEntry::new(
                        "cache hit",
                        json!({ "key": key, "passing": record.passing }),
                    ));
                }
                record
            }
            None => {
                if logging {
                    log.push(LogEntry::new(
                        "evaluating rule",
                        json!({ "rule": rule.name, "kind": rule.kind }),
                    ));
                }

                let timeout = Duration::from_secs(binding.timeout_seconds);
                let record =
                    match tokio::time::timeout(timeout, evaluator.evaluate(rule, &self.context))
                        .await
                    {
                        Ok(Ok(outcome)) => OutcomeRecord::new(outcome.passing, outcome.message),
                        Ok(Err(e)) => {
                            warn!(
                                binding_id = %binding.id,
                                rule = %rule.name,
                                error = %e,
                                "规则执行失败，使用 failure_result"
                            );
                            OutcomeRecord::failed(binding.failure_result, e.message())
                        }
                        Err(_) => {
                            warn!(
                                binding_id = %binding.id,
                                timeout_seconds = binding.timeout_seconds,
                                "规则执行超时，使用 failure_result"
                            );
                            OutcomeRecord::failed(binding.failure_result, TIMEOUT_MESSAGE)
                        }
                    };

                if let (Some(cache), Some(key)) = (&self.cache, &key) {
                    cache.put(key, &record).await;
                }
                record
            }
        };

        let errored = raw.is_error();
        let outcome = raw.apply_negate(binding.negate);
        let duration_ms = start.elapsed().as_millis() as u64;

        if logging {
            log.push(LogEntry::new(
                "rule result",
                json!({
                    "passing": outcome.passing,
                    "message": outcome.message,
                    "error": outcome.error,
                    "negate": binding.negate,
                    "duration_ms": duration_ms,
                }),
            ));
        }
        if rule.execution_logging {
            info!(
                binding_id = %binding.id,
                rule = %rule.name,
                kind = %rule.kind,
                passing = outcome.passing,
                message = ?outcome.message,
                "规则执行日志"
            );
        }
        record_binding_evaluation(&rule.kind, cache_hit, errored);

        BindingOutput {
            binding_id: binding.id,
            rule_id: rule.id,
            kind: rule.kind.clone(),
            outcome,
            cache_hit,
            duration_ms,
            log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::RuleRegistry;
    use crate::models::{Binding, Principal, Rule, kinds};
    use policy_shared::cache::MemoryCache;
    use serde_json::json;

    fn resolved(binding: Binding, rule: Rule) -> ResolvedBinding {
        let evaluator = RuleRegistry::with_builtins().get(&rule.kind).unwrap();
        ResolvedBinding {
            binding,
            rule,
            evaluator,
        }
    }

    fn context() -> Arc<EvaluationContext> {
        Arc::new(EvaluationContext::builder(Principal::new("alice")).build())
    }

    #[tokio::test]
    async fn test_error_uses_failure_result() {
        let rule = Rule::expression("raises", "0 / 0");
        let binding = Binding::rule(uuid::Uuid::new_v4(), rule.id, 0).with_failure_result(true);

        let output = BindingProcess::new(resolved(binding, rule), context())
            .execute()
            .await;
        assert!(output.outcome.passing);
        assert_eq!(output.outcome.message.as_deref(), Some("division by zero"));
        assert!(output.cache_hit.is_none());
        assert!(output.log.is_empty());
    }

    #[tokio::test]
    async fn test_cache_stores_raw_result() {
        let backend = Arc::new(MemoryCache::new());
        let cache = ResultCache::new(backend.clone(), Duration::from_secs(60));
        let rule = Rule::fixed("t", true);
        let binding = Binding::rule(uuid::Uuid::new_v4(), rule.id, 0).negated();
        let ctx = context();

        let first = BindingProcess::new(resolved(binding.clone(), rule.clone()), ctx.clone())
            .with_cache(Some(cache.clone()))
            .execute()
            .await;
        assert_eq!(first.cache_hit, Some(false));
        assert!(!first.outcome.passing);

        let key = cache_key(binding.id, rule.id, &ctx);
        assert!(cache.get(&key).await.unwrap().passing);

        let second = BindingProcess::new(resolved(binding, rule), ctx)
            .with_cache(Some(cache))
            .execute()
            .await;
        assert_eq!(second.cache_hit, Some(true));
        assert!(!second.outcome.passing);
    }

    #[tokio::test]
    async fn test_timeout_uses_failure_result() {
        let rule = Rule::new(
            "slow",
            kinds::FIXED_RESULT,
            json!({ "result": true, "wait_min_ms": 3000, "wait_max_ms": 3000 }),
        );
        let binding = Binding::rule(uuid::Uuid::new_v4(), rule.id, 0).with_timeout(1);

        let output = BindingProcess::new(resolved(binding, rule), context())
            .execute()
            .await;
        assert!(!output.outcome.passing);
        assert_eq!(output.outcome.error.as_deref(), Some(TIMEOUT_MESSAGE));
    }

    #[tokio::test]
    async fn test_log_is_collected() {
        let rule = Rule::fixed("t", false);
        let binding = Binding::rule(uuid::Uuid::new_v4(), rule.id, 0);

        let output = BindingProcess::new(resolved(binding, rule), context())
            .with_log()
            .execute()
            .await;
        let events: Vec<&str> = output.log.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, vec!["evaluating rule", "rule result"]);
    }
}
