//! 缓存管理模块
//!
//! 定义键值缓存抽象 `KeyValueCache`，提供两种实现：
//! - `MemoryCache`：进程内缓存，DashMap 存值，有序键索引支持前缀批量操作
//! - `RedisCache`：Redis 缓存，多实例部署时共享
//!
//! 前缀删除与计数是缓存接口的一等操作，而不是键命名约定的副作用。

use crate::config::{CacheBackend, CacheConfig, RedisConfig};
use crate::error::{Result, SharedError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// 键值缓存接口
///
/// 值统一为序列化后的字符串，由调用方负责编解码。
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// 获取值，过期或不存在时返回 None
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 设置值并指定 TTL
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// 删除指定前缀下的所有键，返回删除数量
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// 统计指定前缀下存活的键数量
    async fn count_prefix(&self, prefix: &str) -> Result<u64>;
}

/// 根据配置创建缓存后端
pub fn build_cache(cache: &CacheConfig, redis: &RedisConfig) -> Result<Arc<dyn KeyValueCache>> {
    match cache.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCache::new())),
        CacheBackend::Redis => Ok(Arc::new(RedisCache::new(redis)?)),
    }
}

// ============================================================================
// 进程内缓存
// ============================================================================

/// 条目数达到该值后写入时顺带清理过期条目
pub const PURGE_THRESHOLD: usize = 1024;

/// 每批 SCAN 的建议数量
const SCAN_BATCH: usize = 500;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 进程内缓存
///
/// 锁顺序固定为先索引后分片：写操作持有索引写锁期间修改 `entries`，
/// 读操作不持有索引锁。
///
/// 过期条目在读到时删除，另外在条目数翻倍时于写入路径整体清理一次。
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, MemoryEntry>>,
    /// 有序键索引，用于前缀扫描
    index: Arc<RwLock<BTreeSet<String>>>,
    /// 下一次整体清理的条目数
    purge_at: Arc<AtomicUsize>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
            index: Arc::default(),
            purge_at: Arc::new(AtomicUsize::new(PURGE_THRESHOLD)),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前存储的条目数量（含未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 清理所有过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut index = self.index.write();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            index.remove(key);
        }
        expired.len()
    }

    fn purge_if_needed(&self) {
        if self.entries.len() < self.purge_at.load(Ordering::Relaxed) {
            return;
        }

        let purged = self.purge_expired();
        let next = (self.entries.len() * 2).max(PURGE_THRESHOLD);
        self.purge_at.store(next, Ordering::Relaxed);
        debug!(purged, next, "内存缓存清理过期条目");
    }

    fn keys_with_prefix(index: &BTreeSet<String>, prefix: &str) -> Vec<String> {
        index
            .range(prefix.to_string()..)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            let mut index = self.index.write();
            if self
                .entries
                .remove_if(key, |_, e| e.is_expired(now))
                .is_some()
            {
                index.remove(key);
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.purge_if_needed();

        let mut index = self.index.write();
        self.entries.insert(key.to_string(), entry);
        index.insert(key.to_string());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut index = self.index.write();
        let keys = Self::keys_with_prefix(&index, prefix);
        let mut deleted = 0;
        for key in keys {
            index.remove(&key);
            if self.entries.remove(&key).is_some() {
                deleted += 1;
            }
        }
        debug!(prefix, deleted, "内存缓存前缀删除");
        Ok(deleted)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let now = Instant::now();
        let index = self.index.read();
        let count = index
            .range(prefix.to_string()..)
            .take_while(|k| k.starts_with(prefix))
            .filter(|k| {
                self.entries
                    .get(k.as_str())
                    .is_some_and(|e| !e.is_expired(now))
            })
            .count();
        Ok(count as u64)
    }
}

// ============================================================================
// Redis 缓存
// ============================================================================

/// Redis 缓存客户端
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
}

impl RedisCache {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(SharedError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    /// 用 SCAN 游标遍历前缀下的键，不阻塞 Redis
    async fn scan_prefix(conn: &mut MultiplexedConnection, prefix: &str) -> Result<Vec<String>> {
        let pattern = Self::pattern(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// 将前缀转换为 SCAN MATCH 模式，转义 glob 特殊字符
    fn pattern(prefix: &str) -> String {
        let mut pattern = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        // SET EX 不接受 0 秒
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let keys = Self::scan_prefix(&mut conn, prefix).await?;

        let mut deleted = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            let count: u64 = conn.del(chunk).await?;
            deleted += count;
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let keys = Self::scan_prefix(&mut conn, prefix).await?;
        // SCAN 可能重复返回同一个键
        let unique: BTreeSet<String> = keys.into_iter().collect();
        Ok(unique.len() as u64)
    }
}
