//! 命令执行器
//!
//! 负责执行各 CLI 子命令的具体逻辑。
//! fixture 模式使用内存存储，否则连接配置中的 PostgreSQL。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use policy_shared::cache::{KeyValueCache, build_cache};
use policy_shared::config::{AppConfig, CacheBackend};

use crate::cache::CacheAdmin;
use crate::context::RequestInfo;
use crate::engine::EngineConfig;
use crate::evaluator::{RuleKindInfo, RuleRegistry};
use crate::models::EngineResult;
use crate::pool::WorkerPool;
use crate::process::BindingOutput;
use crate::repository::PgPolicyRepository;
use crate::resolver::PolicyRepository;
use crate::service::{PolicyEngineService, RuleTestReport};
use crate::store::{Fixture, InMemoryPolicyStore};

/// check 命令参数
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub fixture: Option<PathBuf>,
    pub target: Option<Uuid>,
    pub principal: Option<Uuid>,
    pub no_cache: bool,
    pub debug: bool,
    pub context: Option<String>,
    pub session: Option<String>,
}

/// check 命令输出
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub target: Uuid,
    pub principal: Uuid,
    #[serde(flatten)]
    pub result: EngineResult,
    /// 仅调试模式下输出
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<BindingOutput>,
}

/// 解析命令行传入的附加上下文，必须是 JSON 对象
pub fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("解析上下文 JSON 失败")? {
        Value::Object(map) => Ok(map),
        other => bail!("上下文必须是 JSON 对象, 实际为: {}", other),
    }
}

/// 解析 `--request` 参数，内容为原始请求信息的 JSON
pub fn parse_request(raw: Option<&str>) -> Result<Option<RequestInfo>> {
    raw.map(|raw| serde_json::from_str(raw).context("解析请求 JSON 失败"))
        .transpose()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 命令执行器
///
/// 持有应用配置，按需创建缓存后端、工作池与仓储。
pub struct CommandRunner {
    config: AppConfig,
}

impl CommandRunner {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn worker_pool(&self) -> WorkerPool {
        self.config
            .engine
            .workers
            .map(WorkerPool::new)
            .unwrap_or_default()
    }

    fn cache_backend(&self) -> Result<Arc<dyn KeyValueCache>> {
        if self.config.cache.backend == CacheBackend::Memory {
            warn!("使用进程内缓存, 缓存内容仅在本次命令内有效");
        }
        Ok(build_cache(&self.config.cache, &self.config.redis)?)
    }

    fn service(&self, repository: Arc<dyn PolicyRepository>) -> Result<PolicyEngineService> {
        Ok(PolicyEngineService::new(
            repository,
            RuleRegistry::with_builtins(),
            Some(self.cache_backend()?),
            self.worker_pool(),
            EngineConfig::from(&self.config.engine),
        ))
    }

    async fn connect(&self) -> Result<PgPolicyRepository> {
        let repository = PgPolicyRepository::connect(&self.config.database)
            .await
            .context("连接数据库失败")?;
        repository.health_check().await?;
        Ok(repository)
    }

    /// 执行一次策略评估
    pub async fn check(&self, options: CheckOptions) -> Result<CheckReport> {
        let (repository, target, principal): (Arc<dyn PolicyRepository>, Uuid, Uuid) =
            match &options.fixture {
                Some(path) => {
                    let fixture = Fixture::load(path).await?;
                    let target = match options.target {
                        Some(id) => id,
                        None => fixture
                            .targets
                            .first()
                            .map(|t| t.id)
                            .context("fixture 中没有目标")?,
                    };
                    let principal = match options.principal {
                        Some(id) => id,
                        None => fixture
                            .principals
                            .first()
                            .map(|p| p.id)
                            .context("fixture 中没有主体")?,
                    };
                    (
                        Arc::new(InMemoryPolicyStore::from_fixture(fixture)),
                        target,
                        principal,
                    )
                }
                None => {
                    let target = options.target.context("使用数据库时必须指定 --target")?;
                    let principal = options
                        .principal
                        .context("使用数据库时必须指定 --principal")?;
                    (
                        Arc::new(self.connect().await?),
                        target,
                        principal,
                    )
                }
            };

        let service = self.service(repository)?;
        let mut engine = service.engine_for(target, principal).await?;
        engine.set_use_cache(!options.no_cache)?;
        engine.set_debug(options.debug)?;
        engine.set_context(parse_context(options.context.as_deref())?)?;
        if let Some(session) = options.session {
            engine.set_request(Some(RequestInfo {
                session_key: Some(session),
                ..Default::default()
            }))?;
        }

        let result = engine.build().await?.clone();
        let bindings = if options.debug {
            engine.outputs().to_vec()
        } else {
            Vec::new()
        };

        Ok(CheckReport {
            target,
            principal,
            result,
            bindings,
        })
    }

    /// 执行 check 命令
    pub async fn run_check(&self, options: CheckOptions) -> Result<()> {
        let report = self.check(options).await?;
        info!(
            target_id = %report.target,
            principal_id = %report.principal,
            passing = report.result.passing,
            "策略评估完成"
        );
        print_json(&report)
    }

    /// 以调试模式测试单条规则
    pub async fn test_rule(
        &self,
        fixture: &Path,
        rule: Uuid,
        principal: Uuid,
        context: Option<&str>,
        request: Option<&str>,
    ) -> Result<RuleTestReport> {
        let store = InMemoryPolicyStore::load_fixture(fixture).await?;
        let rule = store
            .rule(rule)
            .with_context(|| format!("fixture 中没有规则 {}", rule))?;
        let principal = store
            .principal(principal)
            .with_context(|| format!("fixture 中没有主体 {}", principal))?;
        let context = parse_context(context)?;
        let request = parse_request(request)?;

        let service = self.service(Arc::new(store))?;
        Ok(service.test_rule(rule, principal, context, request).await?)
    }

    /// 执行 test-rule 命令
    pub async fn run_test_rule(
        &self,
        fixture: &Path,
        rule: Uuid,
        principal: Uuid,
        context: Option<&str>,
        request: Option<&str>,
    ) -> Result<()> {
        let report = self
            .test_rule(fixture, rule, principal, context, request)
            .await?;
        print_json(&report)
    }

    /// 已注册的规则类型
    pub fn kinds(&self) -> Vec<RuleKindInfo> {
        RuleRegistry::with_builtins().kinds()
    }

    /// 执行 kinds 命令
    pub fn run_kinds(&self) -> Result<()> {
        print_json(&self.kinds())
    }

    /// 执行 cache-info 命令
    pub async fn run_cache_info(&self) -> Result<()> {
        let admin = CacheAdmin::new(self.cache_backend()?);
        let policy_keys = admin.cache_info().await?;
        print_json(&json!({ "policy_keys": policy_keys }))
    }

    /// 执行 cache-clear 命令
    pub async fn run_cache_clear(&self) -> Result<()> {
        let admin = CacheAdmin::new(self.cache_backend()?);
        let report = admin.cache_clear().await?;
        info!(
            policy_keys = report.policy_keys,
            app_keys = report.app_keys,
            "缓存已清空"
        );
        print_json(&report)
    }

    /// 执行 migrate 命令
    pub async fn run_migrate(&self) -> Result<()> {
        let repository = self.connect().await?;
        repository.migrate().await?;
        repository.close().await;
        info!("数据库迁移完成");
        Ok(())
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Binding, EngineMode, Group, PolicyTarget, Principal, Rule};
    use crate::store::MembershipRecord;

    struct FixtureFile {
        path: PathBuf,
        target: Uuid,
        principal: Uuid,
        rule: Uuid,
    }

    impl Drop for FixtureFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    async fn write_fixture() -> FixtureFile {
        let target = PolicyTarget::new(EngineMode::All);
        let principal = Principal::new("alice");
        let group = Group::new("admins", None);
        let rule = Rule::expression("admin", "return 'admins' in request.user.groups");
        let fixture = Fixture {
            bindings: vec![Binding::rule(target.id, rule.id, 0)],
            memberships: vec![MembershipRecord {
                principal: principal.id,
                group: group.id,
            }],
            targets: vec![target.clone()],
            principals: vec![principal.clone()],
            groups: vec![group],
            rules: vec![rule.clone()],
        };

        let path = std::env::temp_dir().join(format!("policy-fixture-{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, serde_json::to_string(&fixture).unwrap())
            .await
            .unwrap();
        FixtureFile {
            path,
            target: target.id,
            principal: principal.id,
            rule: rule.id,
        }
    }

    #[test]
    fn test_parse_context() {
        assert!(parse_context(None).unwrap().is_empty());
        let map = parse_context(Some(r#"{"amount": 3}"#)).unwrap();
        assert_eq!(map.get("amount"), Some(&json!(3)));
        assert!(parse_context(Some("[1, 2]")).is_err());
        assert!(parse_context(Some("{not json")).is_err());
    }

    #[test]
    fn test_parse_request() {
        assert!(parse_request(None).unwrap().is_none());
        let request = parse_request(Some(r#"{"remote_ip": "10.0.0.1", "session_key": "s1"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(request.remote_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(request.session_key.as_deref(), Some("s1"));
        assert!(parse_request(Some("[]")).is_err());
    }

    #[tokio::test]
    async fn test_check_defaults_to_first_fixture_entries() {
        let file = write_fixture().await;
        let runner = CommandRunner::new(AppConfig::default());

        let report = runner
            .check(CheckOptions {
                fixture: Some(file.path.clone()),
                debug: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.target, file.target);
        assert_eq!(report.principal, file.principal);
        assert!(report.result.passing);
        assert_eq!(report.bindings.len(), 1);
    }

    #[tokio::test]
    async fn test_check_without_fixture_requires_ids() {
        let runner = CommandRunner::new(AppConfig::default());
        let err = runner.check(CheckOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("--target"));
    }

    #[tokio::test]
    async fn test_rule_from_fixture() {
        let file = write_fixture().await;
        let runner = CommandRunner::new(AppConfig::default());

        let report = runner
            .test_rule(&file.path, file.rule, file.principal, None, None)
            .await
            .unwrap();
        assert!(report.passing);
        assert!(!report.log_messages.is_empty());

        let missing = runner
            .test_rule(&file.path, Uuid::new_v4(), file.principal, None, None)
            .await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_kinds_lists_builtins() {
        let runner = CommandRunner::new(AppConfig::default());
        let kinds: Vec<&str> = runner.kinds().iter().map(|k| k.kind).collect();
        assert_eq!(
            kinds,
            vec!["expression", "fixed_result", "static_group", "static_user"]
        );
    }
}
