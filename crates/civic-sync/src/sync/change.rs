//! 变更记录与变更集
//!
//! ChangeSet 是 Delta Fetcher / Realtime Bridge 与 Change Applier 之间的统一形状。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::payload::EntityPayload;
use super::EntityType;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub kind: ChangeKind,
    /// delete 时可以为空
    pub data: Option<EntityPayload>,
    /// 增量字段的值，用于排序与推进水位
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn upsert(kind: ChangeKind, payload: EntityPayload, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            id: payload.id().to_string(),
            kind,
            data: Some(payload),
            timestamp,
        }
    }

    pub fn delete(id: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            kind: ChangeKind::Delete,
            data: None,
            timestamp,
        }
    }
}

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    ApiIncremental,
    Realtime,
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetMetadata {
    pub sync_time: DateTime<Utc>,
    pub source: ChangeSource,
    /// 每次拉取唯一
    pub batch_id: Uuid,
}

/// 变更集
///
/// 同一 ChangeSet 内不会出现两条相同 id 的记录；
/// 构造时若遇到重复 id，保留最后一条（增量字段最大的那条），位置取最后一次出现处。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entity: EntityType,
    records: Vec<ChangeRecord>,
    pub metadata: ChangeSetMetadata,
}

impl ChangeSet {
    pub fn new(entity: EntityType, records: Vec<ChangeRecord>, source: ChangeSource) -> Self {
        Self {
            entity,
            records: dedup_by_id(records),
            metadata: ChangeSetMetadata {
                sync_time: Utc::now(),
                source,
                batch_id: Uuid::new_v4(),
            },
        }
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 本批次中最大的增量字段值
    pub fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        self.records.iter().filter_map(|r| r.timestamp).max()
    }
}

fn dedup_by_id(records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        last_index.insert(record.id.clone(), index);
    }
    if last_index.len() == records.len() {
        return records;
    }
    records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| last_index.get(&record.id) == Some(index))
        .map(|(_, record)| record)
        .collect()
}
