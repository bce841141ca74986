//! sled 实体缓存：每个实体类型一个 Tree，值带 TTL

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{EntityCache, EntityCacheConfig};
use crate::error::{CivicSyncError, Result};
use crate::storage::kv::KvStore;
use crate::sync::{EntityPayload, EntityType};

const TREE_PREFIX: &str = "entity_cache";

pub struct KvEntityCache {
    kv: Arc<KvStore>,
    config: EntityCacheConfig,
}

impl KvEntityCache {
    pub fn new(kv: Arc<KvStore>, config: EntityCacheConfig) -> Self {
        Self { kv, config }
    }

    fn tree_name(entity: EntityType) -> String {
        format!("{}:{}", TREE_PREFIX, entity.as_str())
    }
}

#[async_trait]
impl EntityCache for KvEntityCache {
    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<EntityPayload>> {
        let tree = Self::tree_name(entity);
        if self.config.ttl_secs == 0 {
            self.kv.get(&tree, id).await
        } else {
            self.kv.get_with_ttl(&tree, id).await
        }
    }

    async fn set(&self, entity: EntityType, id: &str, payload: &EntityPayload) -> Result<()> {
        if payload.entity_type() != entity {
            return Err(CivicSyncError::InvalidData(format!(
                "payload 类型 {} 与缓存键类型 {} 不一致",
                payload.entity_type(),
                entity
            )));
        }
        let tree = Self::tree_name(entity);
        if self.config.ttl_secs == 0 {
            self.kv.set(&tree, id, payload).await
        } else {
            self.kv.set_with_ttl(&tree, id, payload, self.config.ttl_secs).await
        }
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<bool> {
        self.kv.delete(&Self::tree_name(entity), id).await
    }

    async fn keys(&self, entity: EntityType) -> Result<Vec<String>> {
        let tree = Self::tree_name(entity);
        let keys = self.kv.keys(&tree).await?;
        if self.config.ttl_secs == 0 {
            return Ok(keys);
        }
        let mut live = Vec::with_capacity(keys.len());
        for key in keys {
            if self.kv.get_with_ttl::<serde_json::Value>(&tree, &key).await?.is_some() {
                live.push(key);
            }
        }
        Ok(live)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        if self.config.ttl_secs == 0 {
            return Ok(0);
        }
        let mut removed = 0;
        for entity in EntityType::all() {
            removed += self.kv.cleanup_expired(&Self::tree_name(entity)).await?;
        }
        if removed > 0 {
            debug!("清理过期缓存条目: {}", removed);
        }
        Ok(removed)
    }
}
