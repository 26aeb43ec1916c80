//! 内存策略存储
//!
//! 使用 DashMap 保存目标、主体、组、规则与绑定，实现 [`PolicyRepository`]。
//! 用于测试、基准以及 CLI 的 fixture 模式；可以从 JSON fixture 整体加载。

use crate::error::Result;
use crate::models::{Binding, BindingSubject, Group, PolicyTarget, Principal, Rule};
use crate::resolver::{BindingRecord, GroupTree, PolicyRepository};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, instrument};
use uuid::Uuid;

/// 主体与组的直接成员关系
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub principal: Uuid,
    pub group: Uuid,
}

/// 策略数据 fixture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub targets: Vec<PolicyTarget>,
    pub principals: Vec<Principal>,
    pub groups: Vec<Group>,
    pub memberships: Vec<MembershipRecord>,
    pub rules: Vec<Rule>,
    pub bindings: Vec<Binding>,
}

impl Fixture {
    /// 从 JSON 文件读取
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("读取 fixture 失败: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("解析 fixture 失败: {}", path.display()))
    }
}

/// 内存策略存储
#[derive(Clone, Default)]
pub struct InMemoryPolicyStore {
    targets: Arc<DashMap<Uuid, PolicyTarget>>,
    principals: Arc<DashMap<Uuid, Principal>>,
    groups: Arc<DashMap<Uuid, Group>>,
    /// 主体 -> 直接所属组
    memberships: Arc<DashMap<Uuid, Vec<Uuid>>>,
    rules: Arc<DashMap<Uuid, Rule>>,
    bindings: Arc<DashMap<Uuid, Binding>>,
    /// 仓储读取次数，用于验证批量读取
    fetches: Arc<AtomicUsize>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: Fixture) -> Self {
        let store = Self::new();
        for target in fixture.targets {
            store.add_target(target);
        }
        for principal in fixture.principals {
            store.add_principal(principal);
        }
        for group in fixture.groups {
            store.add_group(group);
        }
        for membership in fixture.memberships {
            store.add_member(membership.principal, membership.group);
        }
        for rule in fixture.rules {
            store.add_rule(rule);
        }
        for binding in fixture.bindings {
            store.add_binding(binding);
        }
        store
    }

    /// 从 JSON 文件加载 fixture
    #[instrument]
    pub async fn load_fixture(path: &Path) -> anyhow::Result<Self> {
        let store = Self::from_fixture(Fixture::load(path).await?);
        info!(
            "fixture 已加载: {} 个目标, {} 条绑定, {} 条规则",
            store.targets.len(),
            store.bindings.len(),
            store.rules.len()
        );
        Ok(store)
    }

    pub fn add_target(&self, target: PolicyTarget) -> Uuid {
        let id = target.id;
        self.targets.insert(id, target);
        id
    }

    pub fn add_principal(&self, principal: Principal) -> Uuid {
        let id = principal.id;
        self.principals.insert(id, principal);
        id
    }

    pub fn add_group(&self, group: Group) -> Uuid {
        let id = group.id;
        self.groups.insert(id, group);
        id
    }

    /// 将主体直接加入组
    pub fn add_member(&self, principal: Uuid, group: Uuid) {
        let mut direct = self.memberships.entry(principal).or_default();
        if !direct.contains(&group) {
            direct.push(group);
        }
    }

    pub fn add_rule(&self, rule: Rule) -> Uuid {
        let id = rule.id;
        self.rules.insert(id, rule);
        id
    }

    pub fn add_binding(&self, binding: Binding) -> Uuid {
        let id = binding.id;
        self.bindings.insert(id, binding);
        id
    }

    pub fn target(&self, id: Uuid) -> Option<PolicyTarget> {
        self.targets.get(&id).map(|t| t.clone())
    }

    pub fn principal(&self, id: Uuid) -> Option<Principal> {
        self.principals.get(&id).map(|p| p.clone())
    }

    /// 通过规则 ID 查找规则
    pub fn rule(&self, id: Uuid) -> Option<Rule> {
        self.rules.get(&id).map(|r| r.clone())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// 自创建（或上次重置）以来的仓储读取次数
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn reset_fetch_count(&self) {
        self.fetches.store(0, Ordering::SeqCst);
    }

    fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PolicyRepository for InMemoryPolicyStore {
    async fn fetch_target(&self, id: Uuid) -> Result<Option<PolicyTarget>> {
        self.record_fetch();
        Ok(self.target(id))
    }

    async fn fetch_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        self.record_fetch();
        Ok(self.principal(id))
    }

    async fn fetch_bindings(&self, target: Uuid) -> Result<Vec<BindingRecord>> {
        self.record_fetch();
        let records = self
            .bindings
            .iter()
            .filter(|b| b.target == target)
            .map(|b| {
                let rule = match b.subject {
                    BindingSubject::Rule(id) => self.rule(id),
                    BindingSubject::Group(_) | BindingSubject::User(_) => None,
                };
                BindingRecord::new(b.clone(), rule)
            })
            .collect();
        Ok(records)
    }

    async fn fetch_group_tree(&self, principal: Uuid) -> Result<GroupTree> {
        self.record_fetch();
        let direct = self
            .memberships
            .get(&principal)
            .map(|d| d.clone())
            .unwrap_or_default();

        // 沿 parent 链收集祖先
        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        let mut pending: Vec<Uuid> = direct.clone();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(group) = self.groups.get(&id) {
                if let Some(parent) = group.parent {
                    pending.push(parent);
                }
                groups.push(group.clone());
            }
        }

        Ok(GroupTree { direct, groups })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineMode;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_bindings_joins_rules() {
        let store = InMemoryPolicyStore::new();
        let target = store.add_target(PolicyTarget::new(EngineMode::All));
        let other_target = store.add_target(PolicyTarget::new(EngineMode::All));
        let rule = store.add_rule(Rule::fixed("r", true));
        let group = store.add_group(Group::new("g", None));

        store.add_binding(Binding::rule(target, rule, 0));
        store.add_binding(Binding::group(target, group, 1));
        store.add_binding(Binding::rule(other_target, rule, 0));

        let records = store.fetch_bindings(target).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(
            records
                .iter()
                .any(|r| r.rule.as_ref().map(|rule| rule.id) == Some(rule))
        );
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_group_tree_contains_ancestors_only() {
        let store = InMemoryPolicyStore::new();
        let alice = store.add_principal(Principal::new("alice"));
        let root = store.add_group(Group::new("root", None));
        let leaf = store.add_group(Group::new("leaf", Some(root)));
        store.add_group(Group::new("unrelated", None));
        store.add_member(alice, leaf);
        store.add_member(alice, leaf);

        let tree = store.fetch_group_tree(alice).await.unwrap();
        assert_eq!(tree.direct, vec![leaf]);
        let mut ids: Vec<Uuid> = tree.groups.iter().map(|g| g.id).collect();
        ids.sort();
        let mut expected = vec![root, leaf];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_fetch_count_reset() {
        let store = InMemoryPolicyStore::new();
        store.fetch_target(Uuid::new_v4()).await.unwrap();
        store.fetch_principal(Uuid::new_v4()).await.unwrap();
        assert_eq!(store.fetch_count(), 2);
        store.reset_fetch_count();
        assert_eq!(store.fetch_count(), 0);
    }

    #[test]
    fn test_fixture_deserialization() {
        let target = Uuid::new_v4();
        let rule = Uuid::new_v4();
        let fixture: Fixture = serde_json::from_value(json!({
            "targets": [{ "id": target, "mode": "any" }],
            "rules": [{ "id": rule, "name": "r", "kind": "fixed_result", "config": { "result": true } }],
            "bindings": [{
                "id": Uuid::now_v7(),
                "target": target,
                "subject": { "type": "rule", "id": rule },
                "order": 0
            }]
        }))
        .unwrap();

        let store = InMemoryPolicyStore::from_fixture(fixture);
        let loaded = store.target(target).unwrap();
        assert_eq!(loaded.mode, EngineMode::Any);
        assert!(loaded.empty_result);
        assert_eq!(store.binding_count(), 1);

        let records = tokio_test::block_on(store.fetch_bindings(target)).unwrap();
        assert_eq!(records[0].rule.as_ref().map(|r| r.id), Some(rule));
    }

    #[test]
    fn test_concurrent_binding_inserts() {
        use std::thread;

        let store = InMemoryPolicyStore::new();
        let target = Uuid::new_v4();
        let store_clone = store.clone();

        let handle = thread::spawn(move || {
            for i in 0..100 {
                store_clone.add_binding(Binding::group(target, Uuid::new_v4(), i));
            }
        });
        for i in 100..200 {
            store.add_binding(Binding::group(target, Uuid::new_v4(), i));
        }
        handle.join().unwrap();

        assert_eq!(store.binding_count(), 200);
    }
}
