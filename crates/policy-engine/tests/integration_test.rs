//! 策略引擎集成测试
//!
//! 通过内存存储与内存缓存测试完整的解析、执行、聚合流程。

use async_trait::async_trait;
use policy_engine::cache::binding_prefix;
use policy_engine::pool::{DEADLINE_MESSAGE, PANIC_MESSAGE};
use policy_engine::process::TIMEOUT_MESSAGE;
use policy_engine::{
    Binding, EngineConfig, EngineMode, EvaluationContext, EvaluationError, Group,
    InMemoryPolicyStore, PolicyEngine, PolicyEngineService, PolicyTarget, Principal, RequestInfo,
    Rule, RuleEvaluator, RuleOutcome, RuleRegistry, WorkerPool,
};
use policy_shared::cache::{KeyValueCache, MemoryCache};
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

// ==================== 辅助结构 ====================

struct Harness {
    store: InMemoryPolicyStore,
    backend: Arc<MemoryCache>,
    service: PolicyEngineService,
    principal: Principal,
}

impl Harness {
    fn new() -> Self {
        Self::with(RuleRegistry::with_builtins(), EngineConfig::default())
    }

    fn with(registry: RuleRegistry, config: EngineConfig) -> Self {
        let store = InMemoryPolicyStore::new();
        let backend = Arc::new(MemoryCache::new());
        let cache: Arc<dyn KeyValueCache> = backend.clone();
        let service = PolicyEngineService::new(
            Arc::new(store.clone()),
            registry,
            Some(cache),
            WorkerPool::new(8),
            config,
        );
        let principal = Principal::new("alice");
        store.add_principal(principal.clone());

        Self {
            store,
            backend,
            service,
            principal,
        }
    }

    fn target(&self, mode: EngineMode) -> PolicyTarget {
        let target = PolicyTarget::new(mode);
        self.store.add_target(target.clone());
        target
    }

    fn bind(&self, target: &PolicyTarget, rule: Rule, order: i32) -> Binding {
        let binding = Binding::rule(target.id, rule.id, order);
        self.bind_with(rule, binding)
    }

    fn bind_with(&self, rule: Rule, binding: Binding) -> Binding {
        self.store.add_rule(rule);
        self.store.add_binding(binding.clone());
        binding
    }

    fn engine(&self, target: &PolicyTarget) -> PolicyEngine {
        self.service.engine(target.clone(), self.principal.clone())
    }

    async fn cached_keys(&self, binding: &Binding) -> u64 {
        self.backend
            .count_prefix(&binding_prefix(binding.id))
            .await
            .unwrap()
    }
}

/// 统计调用次数的规则
struct CountingRule {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RuleEvaluator for CountingRule {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn description(&self) -> &'static str {
        "counts invocations"
    }

    async fn evaluate(
        &self,
        _rule: &Rule,
        _context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RuleOutcome::pass())
    }
}

/// 评估时崩溃的规则
struct PanickingRule;

#[async_trait]
impl RuleEvaluator for PanickingRule {
    fn kind(&self) -> &'static str {
        "panicking"
    }

    fn description(&self) -> &'static str {
        "panics during evaluation"
    }

    async fn evaluate(
        &self,
        _rule: &Rule,
        _context: &EvaluationContext,
    ) -> Result<RuleOutcome, EvaluationError> {
        panic!("rule implementation bug");
    }
}

fn messages(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

// ==================== 聚合 ====================

#[tokio::test]
async fn test_engine_empty() {
    let h = Harness::new();
    for mode in [EngineMode::All, EngineMode::Any] {
        let target = h.target(mode);
        let mut engine = h.engine(&target);
        let result = engine.build().await.unwrap();
        assert!(result.passing);
        assert!(result.messages.is_empty());
    }
}

#[tokio::test]
async fn test_engine_simple() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::fixed("true", true), 0);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(result.messages, messages(&["dummy"]));
}

#[tokio::test]
async fn test_engine_mode_all() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::fixed("false", false), 0);
    h.bind(&target, Rule::fixed("true", true), 1);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(!result.passing);
    assert_eq!(result.messages, messages(&["dummy", "dummy"]));
}

#[tokio::test]
async fn test_engine_mode_any() {
    let h = Harness::new();
    let target = h.target(EngineMode::Any);
    h.bind(&target, Rule::fixed("false", false), 0);
    h.bind(&target, Rule::fixed("true", true), 1);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(result.messages, messages(&["dummy", "dummy"]));
}

#[tokio::test]
async fn test_messages_follow_binding_order() {
    let h = Harness::new();
    let target = h.target(EngineMode::Any);
    for (order, message) in [(2, "third"), (0, "first"), (1, "second")] {
        let rule = Rule::new(
            message,
            "fixed_result",
            json!({ "result": true, "message": message }),
        );
        h.bind(&target, rule, order);
    }

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert_eq!(result.messages, messages(&["first", "second", "third"]));
}

#[tokio::test]
async fn test_engine_negate() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let rule = Rule::fixed("false", false);
    let binding = Binding::rule(target.id, rule.id, 0).negated();
    h.bind_with(rule, binding);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(result.messages, messages(&["dummy"]));
}

#[tokio::test]
async fn test_disabled_binding_is_skipped() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::fixed("true", true), 0);
    let rule = Rule::fixed("false", false);
    let binding = Binding::rule(target.id, rule.id, 1).disabled();
    h.bind_with(rule, binding);

    let mut engine = h.engine(&target);
    assert!(engine.build().await.unwrap().passing);
    assert_eq!(engine.outputs().len(), 1);
}

// ==================== 失败处理 ====================

#[tokio::test]
async fn test_engine_policy_error() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::expression("raises", "0 / 0"), 0);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(!result.passing);
    assert_eq!(result.messages, messages(&["division by zero"]));
}

#[tokio::test]
async fn test_engine_policy_error_failure_result() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let rule = Rule::expression("raises", "0 / 0");
    let binding = Binding::rule(target.id, rule.id, 0).with_failure_result(true);
    h.bind_with(rule, binding);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(result.messages, messages(&["division by zero"]));
}

#[tokio::test]
async fn test_negate_inverts_failure_result() {
    for failure_result in [false, true] {
        let h = Harness::new();
        let target = h.target(EngineMode::All);
        let rule = Rule::expression("raises", "0 / 0");
        let binding = Binding::rule(target.id, rule.id, 0)
            .with_failure_result(failure_result)
            .negated();
        h.bind_with(rule, binding);

        let mut engine = h.engine(&target);
        let result = engine.build().await.unwrap();
        assert_eq!(result.passing, !failure_result);
        assert_eq!(result.messages, messages(&["division by zero"]));
    }
}

#[tokio::test]
async fn test_negated_failure_is_not_cached_inverted() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let rule = Rule::expression("raises", "0 / 0");
    let binding = Binding::rule(target.id, rule.id, 0).negated();
    let binding = h.bind_with(rule, binding);

    let mut engine = h.engine(&target);
    assert!(engine.build().await.unwrap().passing);
    assert_eq!(h.cached_keys(&binding).await, 1);

    let mut engine = h.engine(&target);
    assert!(engine.build().await.unwrap().passing);
    assert_eq!(engine.outputs()[0].cache_hit, Some(true));
}

#[tokio::test]
async fn test_deeply_nested_expression_is_contained() {
    let h = Harness::new();
    let target = h.target(EngineMode::Any);
    let source = format!("{}1{}", "(".repeat(2000), ")".repeat(2000));
    h.bind(&target, Rule::expression("deep", source), 0);
    let negations = format!("{}True", "not ".repeat(5000));
    h.bind(&target, Rule::expression("negations", negations), 1);
    h.bind(&target, Rule::fixed("true", true), 2);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(
        result.messages,
        messages(&[
            "expression nested too deeply",
            "expression nested too deeply",
            "dummy"
        ])
    );
}

#[tokio::test]
async fn test_engine_policy_type() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::fixed("true", true), 0);
    h.bind(&target, Rule::new("base", "policy", json!({})), 1);

    let mut engine = h.engine(&target);
    let err = engine.build().await.unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_RULE_TYPE");
    assert!(err.is_fatal());
    assert!(engine.result().is_none());
    assert!(engine.outputs().is_empty());
}

#[tokio::test]
async fn test_binding_timeout() {
    let h = Harness::new();
    let target = h.target(EngineMode::Any);
    let rule = Rule::new(
        "slow",
        "fixed_result",
        json!({ "result": false, "wait_min_ms": 3000, "wait_max_ms": 3000 }),
    );
    let binding = Binding::rule(target.id, rule.id, 0)
        .with_timeout(1)
        .with_failure_result(true);
    h.bind_with(rule, binding);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(result.messages, messages(&[TIMEOUT_MESSAGE]));
}

#[tokio::test]
async fn test_engine_deadline() {
    let config = EngineConfig {
        build_timeout: Some(Duration::from_millis(500)),
        ..Default::default()
    };
    let h = Harness::with(RuleRegistry::with_builtins(), config);
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::fixed("fast", true), 0);
    let slow = Rule::new(
        "slow",
        "fixed_result",
        json!({ "result": true, "wait_min_ms": 3000, "wait_max_ms": 3000 }),
    );
    h.bind(&target, slow, 1);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(!result.passing);
    assert_eq!(result.messages, messages(&["dummy", DEADLINE_MESSAGE]));
}

#[tokio::test]
async fn test_panicking_rule_is_contained() {
    let mut registry = RuleRegistry::with_builtins();
    registry.register(Arc::new(PanickingRule));
    let h = Harness::with(registry, EngineConfig::default());
    let target = h.target(EngineMode::Any);
    h.bind(&target, Rule::new("bug", "panicking", json!({})), 0);
    h.bind(&target, Rule::fixed("true", true), 1);

    let mut engine = h.engine(&target);
    let result = engine.build().await.unwrap();
    assert!(result.passing);
    assert_eq!(result.messages, messages(&[PANIC_MESSAGE, "dummy"]));
}

// ==================== 缓存 ====================

#[tokio::test]
async fn test_engine_cache() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let binding = h.bind(&target, Rule::fixed("false", false), 0);

    assert_eq!(h.cached_keys(&binding).await, 0);
    let mut engine = h.engine(&target);
    assert!(!engine.build().await.unwrap().passing);
    assert_eq!(h.cached_keys(&binding).await, 1);
    assert_eq!(engine.outputs()[0].cache_hit, Some(false));

    let mut engine = h.engine(&target);
    assert!(!engine.build().await.unwrap().passing);
    assert_eq!(h.cached_keys(&binding).await, 1);
    assert_eq!(engine.outputs()[0].cache_hit, Some(true));
}

#[tokio::test]
async fn test_cache_disabled() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let binding = h.bind(&target, Rule::fixed("true", true), 0);

    let mut engine = h.engine(&target);
    engine.set_use_cache(false).unwrap();
    engine.build().await.unwrap();
    assert_eq!(h.cached_keys(&binding).await, 0);
    assert_eq!(engine.outputs()[0].cache_hit, None);
}

#[tokio::test]
async fn test_debug_bypasses_cache() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let binding = h.bind(&target, Rule::fixed("true", true), 0);

    let mut engine = h.engine(&target);
    engine.set_debug(true).unwrap();
    engine.build().await.unwrap();
    assert_eq!(h.cached_keys(&binding).await, 0);
    assert!(!engine.outputs()[0].log.is_empty());
}

#[tokio::test]
async fn test_cache_separates_principals_and_sessions() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let binding = h.bind(&target, Rule::fixed("true", true), 0);

    let mut engine = h.engine(&target);
    engine.build().await.unwrap();

    let mut engine = h.service.engine(target.clone(), Principal::new("bob"));
    engine.build().await.unwrap();
    assert_eq!(h.cached_keys(&binding).await, 2);

    let mut engine = h.engine(&target);
    engine
        .set_request(Some(RequestInfo {
            session_key: Some("session-a".to_string()),
            ..Default::default()
        }))
        .unwrap();
    engine.build().await.unwrap();
    assert_eq!(engine.outputs()[0].cache_hit, Some(false));
    assert_eq!(h.cached_keys(&binding).await, 3);
}

#[tokio::test]
async fn test_negate_applies_to_cached_result() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let rule = Rule::fixed("true", true);
    let binding = Binding::rule(target.id, rule.id, 0).negated();
    h.bind_with(rule, binding);

    for expected_hit in [false, true] {
        let mut engine = h.engine(&target);
        assert!(!engine.build().await.unwrap().passing);
        assert_eq!(engine.outputs()[0].cache_hit, Some(expected_hit));
    }
}

#[tokio::test]
async fn test_cache_clear() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let binding = h.bind(&target, Rule::fixed("true", true), 0);
    h.engine(&target).build().await.unwrap();
    h.backend
        .set("user_app_cache_alice", "[]".to_string(), Duration::from_secs(60))
        .await
        .unwrap();

    let admin = h.service.cache_admin().unwrap();
    assert_eq!(admin.cache_info().await.unwrap(), 1);
    let report = admin.cache_clear().await.unwrap();
    assert_eq!(report.policy_keys, 1);
    assert_eq!(report.app_keys, 1);
    assert_eq!(h.cached_keys(&binding).await, 0);
}

// ==================== 静态绑定 ====================

#[tokio::test]
async fn test_engine_static_bindings() {
    let h = Harness::new();
    let group_a = h.store.add_group(Group::new("group-a", None));
    let group_b = h.store.add_group(Group::new("group-b", None));
    h.store.add_member(h.principal.id, group_b);
    let other_user = Uuid::new_v4();

    let cases = [
        ("Group, not member", Some(group_a), None, false),
        ("Group, member", Some(group_b), None, true),
        ("User, other", None, Some(other_user), false),
        ("User, same", None, Some(h.principal.id), true),
    ];

    for (name, group, user, passing) in cases {
        let target = h.target(EngineMode::All);
        for order in 0..1000 {
            let binding = match (group, user) {
                (Some(group), _) => Binding::group(target.id, group, order),
                (_, Some(user)) => Binding::user(target.id, user, order),
                _ => unreachable!(),
            };
            h.store.add_binding(binding);
        }

        let mut engine = h.engine(&target);
        engine.set_use_cache(false).unwrap();
        h.store.reset_fetch_count();
        let result = engine.build().await.unwrap();
        assert_eq!(result.passing, passing, "{}", name);
        assert!(h.store.fetch_count() <= 2, "{}: {} fetches", name, h.store.fetch_count());
    }
}

#[tokio::test]
async fn test_engine_group_complex() {
    let h = Harness::new();
    let group_a = h.store.add_group(Group::new("group-a", None));
    let group_b = h.store.add_group(Group::new("group-b", Some(group_a)));
    let user = Principal::new("carol");
    h.store.add_principal(user.clone());
    h.store.add_member(user.id, group_b);

    let target = h.target(EngineMode::All);
    h.store.add_binding(Binding::group(target.id, group_a, 0));

    let mut engine = h.service.engine(target.clone(), user);
    engine.set_use_cache(false).unwrap();
    assert!(engine.build().await.unwrap().passing);

    // 父组成员不属于子组
    let target = h.target(EngineMode::All);
    h.store.add_binding(Binding::group(target.id, group_b, 0));
    let parent_member = Principal::new("dave");
    h.store.add_principal(parent_member.clone());
    h.store.add_member(parent_member.id, group_a);

    let mut engine = h.service.engine(target, parent_member);
    assert!(!engine.build().await.unwrap().passing);
}

#[tokio::test]
async fn test_group_cycle_terminates() {
    let h = Harness::new();
    let mut group_a = Group::new("group-a", None);
    let group_b = Group::new("group-b", Some(group_a.id));
    group_a.parent = Some(group_b.id);
    h.store.add_group(group_a.clone());
    h.store.add_group(group_b.clone());
    h.store.add_member(h.principal.id, group_b.id);

    let target = h.target(EngineMode::All);
    h.store.add_binding(Binding::group(target.id, group_a.id, 0));

    let mut engine = h.engine(&target);
    assert!(engine.build().await.unwrap().passing);
}

// ==================== 生命周期 ====================

#[tokio::test]
async fn test_build_is_idempotent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = RuleRegistry::with_builtins();
    registry.register(Arc::new(CountingRule {
        calls: Arc::clone(&calls),
    }));
    let h = Harness::with(registry, EngineConfig::default());
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::new("counting", "counting", json!({})), 0);

    let mut engine = h.engine(&target);
    engine.set_use_cache(false).unwrap();
    let first = engine.build().await.unwrap().clone();
    let second = engine.build().await.unwrap().clone();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.reset();
    engine.build().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_inputs_frozen_after_build() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    let mut engine = h.engine(&target);
    engine.build().await.unwrap();

    assert_eq!(engine.set_debug(true).unwrap_err().code(), "ALREADY_STARTED");
    assert_eq!(
        engine.set_context(Map::new()).unwrap_err().code(),
        "ALREADY_STARTED"
    );
}

#[tokio::test]
async fn test_engine_for_loads_target_and_principal() {
    let h = Harness::new();
    let target = h.target(EngineMode::All);
    h.bind(&target, Rule::expression("self", "request.user.username == 'alice'"), 0);

    let mut engine = h.service.engine_for(target.id, h.principal.id).await.unwrap();
    assert!(engine.build().await.unwrap().passing);

    let err = h
        .service
        .engine_for(target.id, Uuid::new_v4())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "NOT_FOUND");
}

// ==================== 单条规则测试 ====================

#[tokio::test]
async fn test_rule_test_report() {
    let h = Harness::new();
    let mut context = Map::new();
    context.insert("amount".to_string(), json!(50));
    let rule = Rule::expression(
        "amount",
        "ak_message('amount is ' + str(context.amount))\nreturn context.amount < 10",
    );

    let report = h
        .service
        .test_rule(rule, h.principal.clone(), context, None)
        .await
        .unwrap();
    assert!(!report.passing);
    assert_eq!(report.messages, messages(&["amount is 50"]));
    let events: Vec<&str> = report.log_messages.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(events, vec!["evaluating rule", "rule result"]);
    assert_eq!(h.backend.len(), 0);
}
