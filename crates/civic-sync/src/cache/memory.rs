//! 进程内实体缓存（测试与无持久化部署使用）

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::EntityCache;
use crate::error::Result;
use crate::sync::{EntityPayload, EntityType};

type CacheKey = (EntityType, String);

#[derive(Default)]
pub struct MemoryEntityCache {
    entries: RwLock<HashMap<CacheKey, (EntityPayload, Option<Instant>)>>,
    ttl: Option<Duration>,
}

impl MemoryEntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// 当前条目数（含未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// 全量快照，按 (entity, id) 排序，用于比较缓存状态
    pub fn snapshot(&self) -> Vec<(EntityType, String, EntityPayload)> {
        let now = Instant::now();
        let mut items: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|(_, (_, expires_at))| !is_expired(*expires_at, now))
            .map(|((entity, id), (payload, _))| (*entity, id.clone(), payload.clone()))
            .collect();
        items.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        items
    }
}

fn is_expired(expires_at: Option<Instant>, now: Instant) -> bool {
    matches!(expires_at, Some(at) if now >= at)
}

#[async_trait]
impl EntityCache for MemoryEntityCache {
    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<EntityPayload>> {
        let entries = self.entries.read();
        Ok(entries
            .get(&(entity, id.to_string()))
            .filter(|(_, expires_at)| !is_expired(*expires_at, Instant::now()))
            .map(|(payload, _)| payload.clone()))
    }

    async fn set(&self, entity: EntityType, id: &str, payload: &EntityPayload) -> Result<()> {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .insert((entity, id.to_string()), (payload.clone(), expires_at));
        Ok(())
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<bool> {
        Ok(self.entries.write().remove(&(entity, id.to_string())).is_some())
    }

    async fn keys(&self, entity: EntityType) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|((e, _), (_, expires_at))| *e == entity && !is_expired(*expires_at, now))
            .map(|((_, id), _)| id.clone())
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| !is_expired(*expires_at, now));
        Ok((before - entries.len()) as u64)
    }
}
