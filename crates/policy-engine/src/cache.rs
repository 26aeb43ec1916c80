//! 策略结果缓存
//!
//! 缓存的是单条绑定未经 negate 处理的原始结果，键布局：
//!
//! ```text
//! policy_<binding>_<rule>[_<session>]#<principal>[_debug]
//! ```
//!
//! 同一绑定的所有条目共享前缀 `policy_<binding>`，可以按绑定整体失效。
//! 缓存读写失败只记录警告并按未命中处理，不影响评估结果。

use crate::context::EvaluationContext;
use crate::error::Result;
use crate::models::OutcomeRecord;
use policy_shared::cache::KeyValueCache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 策略结果缓存键前缀
pub const CACHE_PREFIX: &str = "policy_";

/// 应用可见性缓存键前缀，清理策略缓存时一并清理
pub const APP_CACHE_PREFIX: &str = "user_app_cache_";

/// 绑定的缓存键前缀
pub fn binding_prefix(binding: Uuid) -> String {
    format!("{}{}", CACHE_PREFIX, binding.simple())
}

/// 计算缓存键
pub fn cache_key(binding: Uuid, rule: Uuid, context: &EvaluationContext) -> String {
    format!(
        "{}_{}{}",
        binding_prefix(binding),
        rule.simple(),
        context.fingerprint()
    )
}

/// 策略结果缓存
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn KeyValueCache>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn KeyValueCache>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 读取缓存结果，任何错误都视为未命中
    pub async fn get(&self, key: &str) -> Option<OutcomeRecord> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "读取策略缓存失败");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "策略缓存内容无法解析");
                None
            }
        }
    }

    /// 写入缓存结果，失败时只记录警告
    pub async fn put(&self, key: &str, record: &OutcomeRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "策略结果序列化失败");
                return;
            }
        };

        if let Err(e) = self.backend.set(key, raw, self.ttl).await {
            warn!(key, error = %e, "写入策略缓存失败");
        }
    }

    /// 使某个绑定的全部缓存条目失效
    #[instrument(skip(self))]
    pub async fn invalidate_binding(&self, binding: Uuid) -> Result<u64> {
        let deleted = self.backend.delete_prefix(&binding_prefix(binding)).await?;
        info!("绑定缓存已失效: {} 条", deleted);
        Ok(deleted)
    }
}

/// 缓存清理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheClearReport {
    pub policy_keys: u64,
    pub app_keys: u64,
}

/// 策略缓存管理
#[derive(Clone)]
pub struct CacheAdmin {
    backend: Arc<dyn KeyValueCache>,
}

impl CacheAdmin {
    pub fn new(backend: Arc<dyn KeyValueCache>) -> Self {
        Self { backend }
    }

    /// 当前缓存的策略结果数量
    #[instrument(skip(self))]
    pub async fn cache_info(&self) -> Result<u64> {
        Ok(self.backend.count_prefix(CACHE_PREFIX).await?)
    }

    /// 清空全部策略结果缓存以及应用可见性缓存
    #[instrument(skip(self))]
    pub async fn cache_clear(&self) -> Result<CacheClearReport> {
        let policy_keys = self.backend.delete_prefix(CACHE_PREFIX).await?;
        let app_keys = self.backend.delete_prefix(APP_CACHE_PREFIX).await?;
        info!(policy_keys, app_keys, "策略缓存已清空");
        Ok(CacheClearReport {
            policy_keys,
            app_keys,
        })
    }
}
