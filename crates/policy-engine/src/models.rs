//! 策略引擎领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use uuid::Uuid;

/// 绑定结果聚合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// 所有绑定通过才通过（AND）
    #[default]
    All,
    /// 任一绑定通过即通过（OR）
    Any,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// 绑定目标（策略挂载的对象，如应用、流程、阶段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTarget {
    pub id: Uuid,
    #[serde(default)]
    pub mode: EngineMode,
    /// 没有任何绑定时的结果
    #[serde(default = "default_true")]
    pub empty_result: bool,
}

impl PolicyTarget {
    pub fn new(mode: EngineMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            empty_result: true,
        }
    }
}

/// 发起请求的主体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub attributes: Value,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: None,
            is_active: true,
            attributes: Value::Null,
        }
    }
}

/// 用户组，通过 parent 形成层级
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent: Option<Uuid>,
}

impl Group {
    pub fn new(name: impl Into<String>, parent: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent,
        }
    }
}

/// 规则类型标识
pub mod kinds {
    pub const STATIC_GROUP: &str = "static_group";
    pub const STATIC_USER: &str = "static_user";
    pub const FIXED_RESULT: &str = "fixed_result";
    pub const EXPRESSION: &str = "expression";
}

/// 规则定义
///
/// `kind` 决定由哪个评估器处理，`config` 的结构由评估器自行解释。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    /// 开启后，每次评估（包括非调试模式）都会记录执行日志
    #[serde(default)]
    pub execution_logging: bool,
}

impl Rule {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: kind.into(),
            config,
            execution_logging: false,
        }
    }

    /// 固定结果规则
    pub fn fixed(name: impl Into<String>, result: bool) -> Self {
        Self::new(name, kinds::FIXED_RESULT, json!({ "result": result }))
    }

    /// 表达式规则
    pub fn expression(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            name,
            kinds::EXPRESSION,
            json!({ "expression": expression.into() }),
        )
    }

    /// 静态组绑定对应的规则，规则 ID 即组 ID
    pub fn static_group(group: Uuid) -> Self {
        Self {
            id: group,
            name: format!("group:{}", group),
            kind: kinds::STATIC_GROUP.to_string(),
            config: json!({ "group": group }),
            execution_logging: false,
        }
    }

    /// 静态用户绑定对应的规则，规则 ID 即用户 ID
    pub fn static_user(user: Uuid) -> Self {
        Self {
            id: user,
            name: format!("user:{}", user),
            kind: kinds::STATIC_USER.to_string(),
            config: json!({ "user": user }),
            execution_logging: false,
        }
    }

    pub fn with_execution_logging(mut self) -> Self {
        self.execution_logging = true;
        self
    }
}

/// 绑定引用的对象：规则、组或用户，三者必居其一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum BindingSubject {
    Rule(Uuid),
    Group(Uuid),
    User(Uuid),
}

impl BindingSubject {
    /// 由可空外键三元组构造，必须恰好一个非空
    pub fn from_parts(
        rule: Option<Uuid>,
        group: Option<Uuid>,
        user: Option<Uuid>,
    ) -> Option<Self> {
        match (rule, group, user) {
            (Some(id), None, None) => Some(Self::Rule(id)),
            (None, Some(id), None) => Some(Self::Group(id)),
            (None, None, Some(id)) => Some(Self::User(id)),
            _ => None,
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

/// 策略绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// UUID v7，按创建时间有序，用作同 order 时的次级排序键
    pub id: Uuid,
    pub target: Uuid,
    pub subject: BindingSubject,
    pub order: i32,
    /// 在聚合前反转规则结果
    #[serde(default)]
    pub negate: bool,
    /// 规则执行失败时使用的结果
    #[serde(default)]
    pub failure_result: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 单条绑定的执行超时
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Binding {
    pub fn new(target: Uuid, subject: BindingSubject, order: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            target,
            subject,
            order,
            negate: false,
            failure_result: false,
            enabled: true,
            timeout_seconds: default_timeout_seconds(),
            created_at: Utc::now(),
        }
    }

    pub fn rule(target: Uuid, rule: Uuid, order: i32) -> Self {
        Self::new(target, BindingSubject::Rule(rule), order)
    }

    pub fn group(target: Uuid, group: Uuid, order: i32) -> Self {
        Self::new(target, BindingSubject::Group(group), order)
    }

    pub fn user(target: Uuid, user: Uuid, order: i32) -> Self {
        Self::new(target, BindingSubject::User(user), order)
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn with_failure_result(mut self, failure_result: bool) -> Self {
        self.failure_result = failure_result;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// 单条绑定的评估结果
///
/// 缓存中保存的是未经 negate 处理的原始结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub passing: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// 规则执行失败时记录的错误描述
    #[serde(default)]
    pub error: Option<String>,
}

impl OutcomeRecord {
    pub fn new(passing: bool, message: Option<String>) -> Self {
        Self {
            passing,
            message: message.filter(|m| !m.is_empty()),
            error: None,
        }
    }

    /// 规则失败时的替代结果，错误描述同时作为消息
    pub fn failed(failure_result: bool, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            passing: failure_result,
            message: Some(error.clone()).filter(|m| !m.is_empty()),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 应用绑定的 negate 标志，失败替代结果同样反转
    pub fn apply_negate(mut self, negate: bool) -> Self {
        if negate {
            self.passing = !self.passing;
        }
        self
    }
}

/// 引擎聚合结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResult {
    pub passing: bool,
    pub messages: Vec<String>,
}

impl EngineResult {
    pub fn new(passing: bool) -> Self {
        Self {
            passing,
            messages: Vec::new(),
        }
    }
}
