//! PostgreSQL 策略仓储
//!
//! 绑定与其规则通过一次 LEFT JOIN 取回；组层级通过递归 CTE 一次取回，
//! 结果中同时标记主体直接所属的组。

use crate::error::{EngineError, Result};
use crate::models::{Binding, BindingSubject, EngineMode, Group, PolicyTarget, Principal, Rule};
use crate::resolver::{BindingRecord, GroupTree, PolicyRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use policy_shared::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(FromRow)]
struct TargetRow {
    id: Uuid,
    mode: String,
    empty_result: bool,
}

#[derive(FromRow)]
struct PrincipalRow {
    id: Uuid,
    username: String,
    email: Option<String>,
    is_active: bool,
    attributes: serde_json::Value,
}

#[derive(FromRow)]
struct BindingRow {
    id: Uuid,
    target_id: Uuid,
    rule_id: Option<Uuid>,
    group_id: Option<Uuid>,
    user_id: Option<Uuid>,
    order: i32,
    negate: bool,
    failure_result: bool,
    enabled: bool,
    timeout_seconds: i32,
    created_at: DateTime<Utc>,
    rule_name: Option<String>,
    rule_kind: Option<String>,
    rule_config: Option<serde_json::Value>,
    rule_execution_logging: Option<bool>,
}

#[derive(FromRow)]
struct GroupRow {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    direct: bool,
}

fn parse_mode(target: Uuid, mode: &str) -> Result<EngineMode> {
    match mode {
        "all" => Ok(EngineMode::All),
        "any" => Ok(EngineMode::Any),
        other => Err(EngineError::Repository(format!(
            "目标 {} 的聚合模式无效: {}",
            target, other
        ))),
    }
}

impl BindingRow {
    fn into_record(self) -> Result<BindingRecord> {
        let subject = BindingSubject::from_parts(self.rule_id, self.group_id, self.user_id)
            .ok_or_else(|| EngineError::InvalidBinding {
                binding: self.id,
                reason: "binding must reference exactly one of rule, group or user".to_string(),
            })?;

        let rule = match (self.rule_id, self.rule_kind) {
            (Some(id), Some(kind)) => Some(Rule {
                id,
                name: self.rule_name.unwrap_or_default(),
                kind,
                config: self.rule_config.unwrap_or(serde_json::Value::Null),
                execution_logging: self.rule_execution_logging.unwrap_or(false),
            }),
            _ => None,
        };

        let binding = Binding {
            id: self.id,
            target: self.target_id,
            subject,
            order: self.order,
            negate: self.negate,
            failure_result: self.failure_result,
            enabled: self.enabled,
            timeout_seconds: u64::try_from(self.timeout_seconds.max(1)).unwrap_or(1),
            created_at: self.created_at,
        };

        Ok(BindingRecord::new(binding, rule))
    }
}

/// PostgreSQL 策略仓储
#[derive(Clone)]
pub struct PgPolicyRepository {
    pool: PgPool,
}

impl PgPolicyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 按配置建立连接池
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "策略数据库连接池已建立");
        Ok(Self::new(pool))
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 执行数据库迁移
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))
    }
}

#[async_trait]
impl PolicyRepository for PgPolicyRepository {
    #[instrument(skip(self))]
    async fn fetch_target(&self, id: Uuid) -> Result<Option<PolicyTarget>> {
        let row = sqlx::query_as::<_, TargetRow>(
            "SELECT id, mode, empty_result FROM policy_targets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(PolicyTarget {
                id: r.id,
                mode: parse_mode(r.id, &r.mode)?,
                empty_result: r.empty_result,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn fetch_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(
            r#"
            SELECT id, username, email, is_active, attributes
            FROM principals
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Principal {
            id: r.id,
            username: r.username,
            email: r.email,
            is_active: r.is_active,
            attributes: r.attributes,
        }))
    }

    #[instrument(skip(self))]
    async fn fetch_bindings(&self, target: Uuid) -> Result<Vec<BindingRecord>> {
        let rows = sqlx::query_as::<_, BindingRow>(
            r#"
            SELECT b.id, b.target_id, b.rule_id, b.group_id, b.user_id,
                   b."order", b.negate, b.failure_result, b.enabled,
                   b.timeout_seconds, b.created_at,
                   r.name AS rule_name, r.kind AS rule_kind,
                   r.config AS rule_config,
                   r.execution_logging AS rule_execution_logging
            FROM policy_bindings b
            LEFT JOIN policy_rules r ON r.id = b.rule_id
            WHERE b.target_id = $1
            ORDER BY b."order", b.id
            "#,
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BindingRow::into_record).collect()
    }

    #[instrument(skip(self))]
    async fn fetch_group_tree(&self, principal: Uuid) -> Result<GroupTree> {
        // UNION 去重保证 parent 环能够终止
        let rows = sqlx::query_as::<_, GroupRow>(
            r#"
            WITH RECURSIVE tree AS (
                SELECT g.id, g.name, g.parent_id, TRUE AS direct
                FROM policy_groups g
                JOIN principal_groups pg ON pg.group_id = g.id
                WHERE pg.principal_id = $1
                UNION
                SELECT p.id, p.name, p.parent_id, FALSE AS direct
                FROM policy_groups p
                JOIN tree t ON p.id = t.parent_id
            )
            SELECT id, name, parent_id, bool_or(direct) AS direct
            FROM tree
            GROUP BY id, name, parent_id
            "#,
        )
        .bind(principal)
        .fetch_all(&self.pool)
        .await?;

        let direct = rows.iter().filter(|r| r.direct).map(|r| r.id).collect();
        let groups = rows
            .into_iter()
            .map(|r| Group {
                id: r.id,
                name: r.name,
                parent: r.parent_id,
            })
            .collect();

        Ok(GroupTree { direct, groups })
    }
}
