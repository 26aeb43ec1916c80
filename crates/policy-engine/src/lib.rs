//! 策略评估引擎
//!
//! 对一个受保护目标（应用、流程、阶段等）与一个请求主体做访问决策：
//! 读取目标上有序的策略绑定，并发评估每条绑定引用的规则，
//! 再按目标的模式（ALL / ANY）聚合为最终结果与消息列表。
//!
//! ## 模块
//!
//! - [`resolver`]：批量读取绑定与组树，解析出可执行的规则
//! - [`evaluator`] / [`expression`]：规则类型注册表与内置规则
//! - [`process`] / [`pool`]：单条绑定的执行流程与并发工作池
//! - [`cache`]：按绑定与主体指纹缓存结果
//! - [`engine`] / [`service`]：一次决策的入口与服务封装
//! - [`store`] / [`repository`]：内存与 PostgreSQL 两种数据来源

pub mod cache;
pub mod cli;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod models;
pub mod pool;
pub mod process;
pub mod repository;
pub mod resolver;
pub mod service;
pub mod store;

pub use cache::{CacheAdmin, CacheClearReport, ResultCache};
pub use context::{EvaluationContext, Membership, RequestInfo};
pub use engine::{EngineConfig, PolicyEngine};
pub use error::{EngineError, Result};
pub use evaluator::{EvaluationError, RuleEvaluator, RuleOutcome, RuleRegistry};
pub use models::{
    Binding, BindingSubject, EngineMode, EngineResult, Group, PolicyTarget, Principal, Rule,
};
pub use pool::WorkerPool;
pub use process::{BindingOutput, LogEntry};
pub use repository::PgPolicyRepository;
pub use resolver::{BindingResolver, PolicyRepository};
pub use service::{PolicyEngineService, RuleTestReport};
pub use store::{Fixture, InMemoryPolicyStore};
