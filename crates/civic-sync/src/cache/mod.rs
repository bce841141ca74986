//! 实体缓存 - 以 (entity_type, entity_id) 为键的 KV 缓存
//!
//! 同一个键的并发写入以最后一次为准。

pub mod kv_cache;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::sync::{EntityPayload, EntityType};

pub use kv_cache::KvEntityCache;
pub use memory::MemoryEntityCache;

/// 缓存条目过期时间配置
#[derive(Debug, Clone)]
pub struct EntityCacheConfig {
    /// 过期时间（秒），0 表示永不过期
    pub ttl_secs: u64,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
        }
    }
}

#[async_trait]
pub trait EntityCache: Send + Sync {
    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<EntityPayload>>;

    async fn set(&self, entity: EntityType, id: &str, payload: &EntityPayload) -> Result<()>;

    /// 返回该键之前是否存在
    async fn delete(&self, entity: EntityType, id: &str) -> Result<bool>;

    /// 枚举实体类型下所有未过期的 id（搜索索引重建、对账用）
    async fn keys(&self, entity: EntityType) -> Result<Vec<String>>;

    async fn contains(&self, entity: EntityType, id: &str) -> Result<bool> {
        Ok(self.get(entity, id).await?.is_some())
    }

    /// 清理过期条目，返回清理数量
    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(0)
    }
}
