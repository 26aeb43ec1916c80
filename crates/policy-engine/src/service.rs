//! 策略引擎服务
//!
//! 持有仓储、规则注册表、缓存后端与工作池，为每次决策创建 [`PolicyEngine`]，
//! 并提供单条规则测试与缓存管理。

use crate::cache::{CacheAdmin, ResultCache};
use crate::context::{EvaluationContext, RequestInfo};
use crate::engine::{EngineConfig, PolicyEngine};
use crate::error::{EngineError, Result};
use crate::evaluator::RuleRegistry;
use crate::models::{Binding, PolicyTarget, Principal, Rule};
use crate::pool::WorkerPool;
use crate::process::{BindingProcess, LogEntry};
use crate::resolver::{BindingRecord, BindingResolver, PolicyRepository};
use policy_shared::cache::KeyValueCache;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// 单条规则测试结果
#[derive(Debug, Clone, Serialize)]
pub struct RuleTestReport {
    pub passing: bool,
    pub messages: Vec<String>,
    pub log_messages: Vec<LogEntry>,
}

/// 策略引擎服务
#[derive(Clone)]
pub struct PolicyEngineService {
    resolver: BindingResolver,
    cache: Option<Arc<dyn KeyValueCache>>,
    pool: WorkerPool,
    config: EngineConfig,
}

impl PolicyEngineService {
    pub fn new(
        repository: Arc<dyn PolicyRepository>,
        registry: RuleRegistry,
        cache: Option<Arc<dyn KeyValueCache>>,
        pool: WorkerPool,
        config: EngineConfig,
    ) -> Self {
        info!(
            workers = pool.size(),
            cache_enabled = cache.is_some(),
            "策略引擎服务已创建"
        );
        Self {
            resolver: BindingResolver::new(repository, registry),
            cache,
            pool,
            config,
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        self.resolver.registry()
    }

    pub fn repository(&self) -> &Arc<dyn PolicyRepository> {
        self.resolver.repository()
    }

    pub fn result_cache(&self) -> Option<ResultCache> {
        self.cache
            .as_ref()
            .map(|backend| ResultCache::new(Arc::clone(backend), self.config.cache_ttl))
    }

    /// 未配置缓存后端时为 None
    pub fn cache_admin(&self) -> Option<CacheAdmin> {
        self.cache.as_ref().map(|b| CacheAdmin::new(Arc::clone(b)))
    }

    /// 为目标与主体创建引擎
    pub fn engine(&self, target: PolicyTarget, principal: Principal) -> PolicyEngine {
        PolicyEngine::new(
            target,
            principal,
            self.resolver.clone(),
            self.result_cache(),
            self.pool.clone(),
            self.config.clone(),
        )
    }

    /// 按 ID 读取目标与主体后创建引擎
    #[instrument(skip(self))]
    pub async fn engine_for(&self, target_id: Uuid, principal_id: Uuid) -> Result<PolicyEngine> {
        let repository = self.repository();
        let target = repository
            .fetch_target(target_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "target",
                id: target_id,
            })?;
        let principal = repository
            .fetch_principal(principal_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "principal",
                id: principal_id,
            })?;

        Ok(self.engine(target, principal))
    }

    /// 以调试模式对单个主体执行一条规则，不读写缓存
    ///
    /// `request` 为发起测试的原始请求，规则可通过 `request.http` 读取。
    /// 未知规则类型同样是致命错误。
    #[instrument(skip(self, rule, principal, context, request), fields(rule_id = %rule.id, kind = %rule.kind))]
    pub async fn test_rule(
        &self,
        rule: Rule,
        principal: Principal,
        context: Map<String, Value>,
        request: Option<RequestInfo>,
    ) -> Result<RuleTestReport> {
        let binding = Binding::rule(Uuid::nil(), rule.id, 0)
            .with_timeout(self.config.default_binding_timeout.as_secs());
        let resolved = self
            .resolver
            .resolve_record(BindingRecord::new(binding, Some(rule)))?;

        let membership = self.resolver.load_membership(&principal).await?;
        let context = EvaluationContext::builder(principal)
            .extra(context)
            .request(request)
            .debug(true)
            .membership(membership)
            .build();

        let output = BindingProcess::new(resolved, Arc::new(context))
            .with_log()
            .execute()
            .await;

        Ok(RuleTestReport {
            passing: output.outcome.passing,
            messages: output.outcome.message.into_iter().collect(),
            log_messages: output.log,
        })
    }
}
