//! 搜索索引 - 实体缓存之上的二级缓存
//!
//! 倒排索引：词 → 实体 id，按实体类型隔离。随每条已应用变更增量刷新，
//! 也可以通过缓存的键枚举整体重建。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::applier::ChangeHook;
use super::change::{ChangeKind, ChangeRecord};
use super::payload::EntityPayload;
use super::EntityType;
use crate::cache::EntityCache;
use crate::error::Result;

#[derive(Default)]
struct EntityIndex {
    postings: HashMap<String, HashSet<String>>,
    /// id → 该文档的词，删除时用于反查
    documents: HashMap<String, Vec<String>>,
}

impl EntityIndex {
    fn insert(&mut self, id: &str, tokens: Vec<String>) {
        self.remove(id);
        for token in &tokens {
            self.postings
                .entry(token.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.documents.insert(id.to_string(), tokens);
    }

    fn remove(&mut self, id: &str) {
        let Some(tokens) = self.documents.remove(id) else {
            return;
        };
        for token in tokens {
            if let Some(ids) = self.postings.get_mut(&token) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct SearchIndex {
    indexes: RwLock<HashMap<EntityType, EntityIndex>>,
}

/// 小写化并按非字母数字切分，丢弃单字符
pub fn tokenize(text: &str) -> Vec<String> {
    let unique: BTreeSet<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
        .collect();
    unique.into_iter().collect()
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, payload: &EntityPayload) {
        let tokens = tokenize(&payload.search_text());
        self.indexes
            .write()
            .entry(payload.entity_type())
            .or_default()
            .insert(payload.id(), tokens);
    }

    pub fn remove(&self, entity: EntityType, id: &str) {
        if let Some(index) = self.indexes.write().get_mut(&entity) {
            index.remove(id);
        }
    }

    /// 查询全部词都命中的实体 id，按 id 排序
    pub fn search(&self, entity: EntityType, query: &str) -> Vec<String> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }
        let indexes = self.indexes.read();
        let Some(index) = indexes.get(&entity) else {
            return Vec::new();
        };

        let mut result: Option<HashSet<&String>> = None;
        for token in &tokens {
            let Some(ids) = index.postings.get(token) else {
                return Vec::new();
            };
            result = Some(match result {
                None => ids.iter().collect(),
                Some(acc) => acc.into_iter().filter(|id| ids.contains(*id)).collect(),
            });
        }

        let mut ids: Vec<String> = result
            .unwrap_or_default()
            .into_iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn document_count(&self, entity: EntityType) -> usize {
        self.indexes
            .read()
            .get(&entity)
            .map_or(0, |index| index.documents.len())
    }

    /// 按缓存内容重建某个实体类型的索引，返回索引文档数
    pub async fn rebuild(&self, entity: EntityType, cache: &dyn EntityCache) -> Result<usize> {
        let mut rebuilt = EntityIndex::default();
        for id in cache.keys(entity).await? {
            if let Some(payload) = cache.get(entity, &id).await? {
                rebuilt.insert(&id, tokenize(&payload.search_text()));
            }
        }
        let count = rebuilt.documents.len();
        self.indexes.write().insert(entity, rebuilt);
        Ok(count)
    }
}

#[async_trait]
impl ChangeHook for SearchIndex {
    fn name(&self) -> &str {
        "search_index"
    }

    async fn on_change(&self, entity: EntityType, record: &ChangeRecord) -> Result<()> {
        match (record.kind, &record.data) {
            (ChangeKind::Delete, _) => self.remove(entity, &record.id),
            (_, Some(payload)) => self.index(payload),
            (_, None) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryEntityCache;
    use serde_json::json;

    fn bill(id: &str, title: &str) -> EntityPayload {
        EntityPayload::from_value(EntityType::Bills, json!({"id": id, "title": title})).unwrap()
    }

    #[test]
    fn tokenize_normalizes() {
        assert_eq!(tokenize("Clean-Water Act, a"), vec!["act", "clean", "water"]);
    }

    #[tokio::test]
    async fn change_hook_indexes_and_removes() {
        let index = SearchIndex::new();
        let create = ChangeRecord::upsert(ChangeKind::Create, bill("hr1", "Clean Water Act"), None);
        index.on_change(EntityType::Bills, &create).await.unwrap();
        index
            .on_change(
                EntityType::Bills,
                &ChangeRecord::upsert(ChangeKind::Create, bill("hr2", "Clean Air Act"), None),
            )
            .await
            .unwrap();

        assert_eq!(index.search(EntityType::Bills, "clean act"), vec!["hr1", "hr2"]);
        assert_eq!(index.search(EntityType::Bills, "water"), vec!["hr1"]);

        // 更新会替换旧词
        index
            .on_change(
                EntityType::Bills,
                &ChangeRecord::upsert(ChangeKind::Update, bill("hr1", "Farm Bill"), None),
            )
            .await
            .unwrap();
        assert!(index.search(EntityType::Bills, "water").is_empty());

        index
            .on_change(EntityType::Bills, &ChangeRecord::delete("hr2", None))
            .await
            .unwrap();
        assert!(index.search(EntityType::Bills, "air").is_empty());
        assert_eq!(index.document_count(EntityType::Bills), 1);
    }

    #[tokio::test]
    async fn rebuild_from_cache_keys() {
        let cache = MemoryEntityCache::new();
        cache.set(EntityType::Bills, "hr9", &bill("hr9", "Highway Funding")).await.unwrap();
        let index = SearchIndex::new();
        assert_eq!(index.rebuild(EntityType::Bills, &cache).await.unwrap(), 1);
        assert_eq!(index.search(EntityType::Bills, "highway"), vec!["hr9"]);
    }
}
