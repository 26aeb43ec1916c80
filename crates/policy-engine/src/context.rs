//! 评估上下文
//!
//! 一次评估中所有绑定共享同一个只读上下文：请求主体、可选的原始请求信息、
//! 附加上下文数据、调试标志，以及预先计算好的组成员关系。

use crate::models::{Group, Principal};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// 原始传输层请求信息，引擎只透传给规则使用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    /// 会话标识，参与缓存键计算
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub remote_ip: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// 主体的有效组成员关系
///
/// 主体属于组 G，当且仅当主体直接属于 G，或直接属于 G 的某个后代组。
/// 等价地：有效组集合 = 直接组及其沿 parent 链的全部祖先。
#[derive(Debug, Clone, Default)]
pub struct Membership {
    groups: HashMap<Uuid, Group>,
}

impl Membership {
    /// 由直接所属组与组树快照计算有效组集合
    ///
    /// 沿 parent 链向上遍历，已访问集合保证 parent 环不会导致死循环。
    pub fn resolve(direct: &[Uuid], tree: &[Group]) -> Self {
        let by_id: HashMap<Uuid, &Group> = tree.iter().map(|g| (g.id, g)).collect();
        let mut visited = HashSet::new();
        let mut groups = HashMap::new();

        for start in direct {
            let mut current = Some(*start);
            while let Some(id) = current {
                if !visited.insert(id) {
                    break;
                }
                let Some(group) = by_id.get(&id) else {
                    break;
                };
                groups.insert(id, (*group).clone());
                current = group.parent;
            }
        }

        Self { groups }
    }

    pub fn is_member(&self, group: Uuid) -> bool {
        self.groups.contains_key(&group)
    }

    /// 有效组名称（排序后）
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.values().map(|g| g.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// 评估上下文，构建后不可变
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    principal: Principal,
    request: Option<RequestInfo>,
    extra: Map<String, Value>,
    debug: bool,
    membership: Arc<Membership>,
}

impl EvaluationContext {
    pub fn builder(principal: Principal) -> EvaluationContextBuilder {
        EvaluationContextBuilder {
            principal,
            request: None,
            extra: Map::new(),
            debug: false,
            membership: Arc::new(Membership::default()),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn request(&self) -> Option<&RequestInfo> {
        self.request.as_ref()
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// 缓存指纹中与上下文相关的部分
    ///
    /// 形如 `[_<session>]#<principal>[_debug]`。
    pub fn fingerprint(&self) -> String {
        let mut fingerprint = String::new();
        if let Some(session) = self.request.as_ref().and_then(|r| r.session_key.as_deref()) {
            fingerprint.push('_');
            fingerprint.push_str(session);
        }
        fingerprint.push('#');
        fingerprint.push_str(&self.principal.id.simple().to_string());
        if self.debug {
            fingerprint.push_str("_debug");
        }
        fingerprint
    }

    /// 表达式规则可见的 `request` 对象
    pub fn to_value(&self) -> Value {
        let principal = &self.principal;
        let http = self
            .request
            .as_ref()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);

        json!({
            "user": {
                "id": principal.id.to_string(),
                "username": principal.username,
                "email": principal.email,
                "is_active": principal.is_active,
                "attributes": principal.attributes,
                "groups": self.membership.group_names(),
            },
            "context": Value::Object(self.extra.clone()),
            "http": http,
            "debug": self.debug,
        })
    }
}

/// 评估上下文构建器
pub struct EvaluationContextBuilder {
    principal: Principal,
    request: Option<RequestInfo>,
    extra: Map<String, Value>,
    debug: bool,
    membership: Arc<Membership>,
}

impl EvaluationContextBuilder {
    pub fn request(mut self, request: Option<RequestInfo>) -> Self {
        self.request = request;
        self
    }

    pub fn extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn membership(mut self, membership: Membership) -> Self {
        self.membership = Arc::new(membership);
        self
    }

    pub fn build(self) -> EvaluationContext {
        EvaluationContext {
            principal: self.principal,
            request: self.request,
            extra: self.extra,
            debug: self.debug,
            membership: self.membership,
        }
    }
}
