//! 绑定解析
//!
//! 一次性读取目标下的全部绑定（规则随绑定一起取回），过滤、排序，
//! 并为每条绑定找到评估器。组/用户绑定在此合成为静态规则，
//! 成员关系由一次组树读取预先算好，不会按绑定逐条查询。

use crate::context::Membership;
use crate::error::{EngineError, Result};
use crate::evaluator::{RuleEvaluator, RuleRegistry};
use crate::models::{Binding, BindingSubject, Group, PolicyTarget, Principal, Rule};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// 绑定及其引用的规则
///
/// 规则绑定必须携带 `rule`；组/用户绑定的 `rule` 为空。
#[derive(Debug, Clone)]
pub struct BindingRecord {
    pub binding: Binding,
    pub rule: Option<Rule>,
}

impl BindingRecord {
    pub fn new(binding: Binding, rule: Option<Rule>) -> Self {
        Self { binding, rule }
    }
}

/// 主体所在的组树快照
#[derive(Debug, Clone, Default)]
pub struct GroupTree {
    /// 主体直接所属的组
    pub direct: Vec<Uuid>,
    /// 直接组及其全部祖先
    pub groups: Vec<Group>,
}

/// 策略数据仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn fetch_target(&self, id: Uuid) -> Result<Option<PolicyTarget>>;

    async fn fetch_principal(&self, id: Uuid) -> Result<Option<Principal>>;

    /// 读取目标的全部绑定（含禁用的），规则一并取回
    async fn fetch_bindings(&self, target: Uuid) -> Result<Vec<BindingRecord>>;

    /// 读取主体的直接组与组层级
    async fn fetch_group_tree(&self, principal: Uuid) -> Result<GroupTree>;
}

/// 已解析、可直接执行的绑定
#[derive(Clone)]
pub struct ResolvedBinding {
    pub binding: Binding,
    pub rule: Rule,
    pub evaluator: Arc<dyn RuleEvaluator>,
}

impl fmt::Debug for ResolvedBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedBinding")
            .field("binding", &self.binding.id)
            .field("rule", &self.rule.id)
            .field("kind", &self.evaluator.kind())
            .finish()
    }
}

/// 绑定解析器
#[derive(Clone)]
pub struct BindingResolver {
    repository: Arc<dyn PolicyRepository>,
    registry: RuleRegistry,
}

impl BindingResolver {
    pub fn new(repository: Arc<dyn PolicyRepository>, registry: RuleRegistry) -> Self {
        Self {
            repository,
            registry,
        }
    }

    /// 解析目标下启用的绑定，按 (order, id) 排序
    ///
    /// 任何一条绑定无法解析都会使整个解析失败，不返回部分结果。
    #[instrument(skip(self, target), fields(target_id = %target.id))]
    pub async fn resolve(&self, target: &PolicyTarget) -> Result<Vec<ResolvedBinding>> {
        let mut records: Vec<BindingRecord> = self
            .repository
            .fetch_bindings(target.id)
            .await?
            .into_iter()
            .filter(|r| r.binding.enabled)
            .collect();
        records.sort_by_key(|r| (r.binding.order, r.binding.id));

        let resolved = records
            .into_iter()
            .map(|record| self.resolve_record(record))
            .collect::<Result<Vec<_>>>()?;

        debug!("解析绑定完成: {} 条", resolved.len());
        Ok(resolved)
    }

    /// 解析单条绑定
    pub fn resolve_record(&self, record: BindingRecord) -> Result<ResolvedBinding> {
        let BindingRecord { binding, rule } = record;

        let rule = match binding.subject {
            BindingSubject::Rule(id) => match rule {
                Some(rule) if rule.id == id => rule,
                Some(rule) => {
                    return Err(EngineError::InvalidBinding {
                        binding: binding.id,
                        reason: format!("rule {} does not match referenced rule {}", rule.id, id),
                    });
                }
                None => {
                    return Err(EngineError::InvalidBinding {
                        binding: binding.id,
                        reason: format!("referenced rule {} not found", id),
                    });
                }
            },
            BindingSubject::Group(id) => Rule::static_group(id),
            BindingSubject::User(id) => Rule::static_user(id),
        };

        let Some(evaluator) = self.registry.get(&rule.kind) else {
            warn!(binding_id = %binding.id, kind = %rule.kind, "未知的规则类型");
            return Err(EngineError::UnknownRuleType {
                binding: binding.id,
                kind: rule.kind,
            });
        };

        Ok(ResolvedBinding {
            binding,
            rule,
            evaluator,
        })
    }

    /// 读取并计算主体的有效组成员关系
    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn load_membership(&self, principal: &Principal) -> Result<Membership> {
        let tree = self.repository.fetch_group_tree(principal.id).await?;
        Ok(Membership::resolve(&tree.direct, &tree.groups))
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn PolicyRepository> {
        &self.repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineMode, kinds};
    use serde_json::json;

    fn resolver(records: Vec<BindingRecord>) -> BindingResolver {
        let mut repository = MockPolicyRepository::new();
        repository
            .expect_fetch_bindings()
            .times(1)
            .returning(move |_| Ok(records.clone()));
        BindingResolver::new(Arc::new(repository), RuleRegistry::with_builtins())
    }

    #[tokio::test]
    async fn test_resolve_filters_and_sorts() {
        let target = PolicyTarget::new(EngineMode::All);
        let late = Rule::fixed("late", true);
        let early = Rule::fixed("early", true);
        let tie_first = Rule::fixed("tie-first", true);
        let tie_second = Rule::fixed("tie-second", true);
        let disabled = Rule::fixed("disabled", true);

        let late_binding = Binding::rule(target.id, late.id, 10);
        let tie_first_binding = Binding::rule(target.id, tie_first.id, 5);
        let tie_second_binding = Binding::rule(target.id, tie_second.id, 5);
        let early_binding = Binding::rule(target.id, early.id, 0);
        let disabled_binding = Binding::rule(target.id, disabled.id, 1).disabled();

        let resolver = resolver(vec![
            BindingRecord::new(tie_second_binding, Some(tie_second)),
            BindingRecord::new(late_binding, Some(late)),
            BindingRecord::new(disabled_binding, Some(disabled)),
            BindingRecord::new(early_binding, Some(early)),
            BindingRecord::new(tie_first_binding, Some(tie_first)),
        ]);

        let resolved = resolver.resolve(&target).await.unwrap();
        let names: Vec<&str> = resolved.iter().map(|r| r.rule.name.as_str()).collect();
        assert_eq!(names, vec!["early", "tie-first", "tie-second", "late"]);
    }

    #[tokio::test]
    async fn test_group_and_user_bindings_become_static_rules() {
        let target = PolicyTarget::new(EngineMode::Any);
        let group = Uuid::new_v4();
        let user = Uuid::new_v4();

        let resolver = resolver(vec![
            BindingRecord::new(Binding::group(target.id, group, 0), None),
            BindingRecord::new(Binding::user(target.id, user, 1), None),
        ]);

        let resolved = resolver.resolve(&target).await.unwrap();
        assert_eq!(resolved[0].rule.kind, kinds::STATIC_GROUP);
        assert_eq!(resolved[0].rule.id, group);
        assert_eq!(resolved[1].rule.kind, kinds::STATIC_USER);
        assert_eq!(resolved[1].evaluator.kind(), kinds::STATIC_USER);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_fatal() {
        let target = PolicyTarget::new(EngineMode::All);
        let known = Rule::fixed("known", true);
        let unknown = Rule::new("base", "policy", json!({}));
        let unknown_binding = Binding::rule(target.id, unknown.id, 1);
        let unknown_binding_id = unknown_binding.id;

        let resolver = resolver(vec![
            BindingRecord::new(Binding::rule(target.id, known.id, 0), Some(known)),
            BindingRecord::new(unknown_binding, Some(unknown)),
        ]);

        match resolver.resolve(&target).await {
            Err(EngineError::UnknownRuleType { binding, kind }) => {
                assert_eq!(binding, unknown_binding_id);
                assert_eq!(kind, "policy");
            }
            other => panic!("expected UnknownRuleType, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_rule_is_invalid_binding() {
        let target = PolicyTarget::new(EngineMode::All);
        let resolver = resolver(vec![BindingRecord::new(
            Binding::rule(target.id, Uuid::new_v4(), 0),
            None,
        )]);

        let err = resolver.resolve(&target).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_BINDING");
    }

    #[tokio::test]
    async fn test_load_membership_uses_single_fetch() {
        let parent = Group::new("parent", None);
        let child = Group::new("child", Some(parent.id));
        let tree = GroupTree {
            direct: vec![child.id],
            groups: vec![parent.clone(), child.clone()],
        };

        let mut repository = MockPolicyRepository::new();
        repository
            .expect_fetch_group_tree()
            .times(1)
            .returning(move |_| Ok(tree.clone()));
        let resolver = BindingResolver::new(Arc::new(repository), RuleRegistry::with_builtins());

        let membership = resolver
            .load_membership(&Principal::new("alice"))
            .await
            .unwrap();
        assert!(membership.is_member(parent.id));
        assert!(membership.is_member(child.id));
    }
}
