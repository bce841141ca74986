//! 变更应用器
//!
//! 职责：
//! 1. create/update 写缓存，delete 删缓存（按拉取顺序逐条应用）
//! 2. 每条记录应用后执行二级缓存钩子（搜索索引等）并通知订阅者
//! 3. 整批应用完成后级联：把本实体声明的依赖实体按各自优先级入队，只走一跳
//!
//! 重放同一个 ChangeSet 得到相同的缓存状态。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::change::{ChangeKind, ChangeRecord, ChangeSet};
use super::entity_config::SyncConfig;
use super::notifier::{ChangeNotification, SubscriptionNotifier};
use super::queue::{SyncQueue, TaskOrigin};
use super::state::SyncStateRegistry;
use super::EntityType;
use crate::cache::EntityCache;
use crate::error::Result;

/// 记录应用后的二级处理钩子
///
/// 钩子失败只记录日志，不影响主缓存写入与后续钩子。
#[async_trait]
pub trait ChangeHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_change(&self, entity: EntityType, record: &ChangeRecord) -> Result<()>;
}

/// 单次应用的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// 缺少 payload 的 create/update
    pub skipped: usize,
    /// 本次级联入队的依赖实体（已去重）
    pub cascaded: Vec<EntityType>,
    pub high_water_mark: Option<DateTime<Utc>>,
}

impl ApplySummary {
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

pub struct ChangeApplier {
    cache: Arc<dyn EntityCache>,
    notifier: Arc<SubscriptionNotifier>,
    hooks: RwLock<Vec<Arc<dyn ChangeHook>>>,
    configs: Arc<HashMap<EntityType, SyncConfig>>,
    queue: Arc<SyncQueue>,
    states: Arc<SyncStateRegistry>,
}

impl ChangeApplier {
    pub fn new(
        cache: Arc<dyn EntityCache>,
        notifier: Arc<SubscriptionNotifier>,
        configs: Arc<HashMap<EntityType, SyncConfig>>,
        queue: Arc<SyncQueue>,
        states: Arc<SyncStateRegistry>,
    ) -> Self {
        Self {
            cache,
            notifier,
            hooks: RwLock::new(Vec::new()),
            configs,
            queue,
            states,
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn ChangeHook>) {
        info!("注册变更钩子: {}", hook.name());
        self.hooks.write().push(hook);
    }

    /// 应用整个变更集并触发一跳级联
    pub async fn apply(&self, change_set: &ChangeSet) -> Result<ApplySummary> {
        let mut summary = self.apply_records(change_set).await?;
        if summary.applied() > 0 {
            summary.cascaded = self.cascade(change_set.entity);
        }
        debug!(
            "应用 {} 变更完成: created={}, updated={}, deleted={}, skipped={}, cascaded={:?}",
            change_set.entity,
            summary.created,
            summary.updated,
            summary.deleted,
            summary.skipped,
            summary.cascaded
        );
        Ok(summary)
    }

    async fn apply_records(&self, change_set: &ChangeSet) -> Result<ApplySummary> {
        let entity = change_set.entity;
        let hooks: Vec<Arc<dyn ChangeHook>> = self.hooks.read().clone();
        let mut summary = ApplySummary::default();

        for record in change_set.records() {
            match record.kind {
                ChangeKind::Create | ChangeKind::Update => {
                    let Some(payload) = record.data.as_ref() else {
                        warn!("{} 记录 {} 缺少 payload，跳过", entity, record.id);
                        summary.skipped += 1;
                        continue;
                    };
                    self.cache.set(entity, &record.id, payload).await?;
                    if record.kind == ChangeKind::Create {
                        summary.created += 1;
                    } else {
                        summary.updated += 1;
                    }
                }
                ChangeKind::Delete => {
                    self.cache.delete(entity, &record.id).await?;
                    summary.deleted += 1;
                }
            }

            if let Some(ts) = record.timestamp {
                summary.high_water_mark = Some(summary.high_water_mark.map_or(ts, |m| m.max(ts)));
            }

            for hook in &hooks {
                if let Err(e) = hook.on_change(entity, record).await {
                    warn!("变更钩子 {} 处理 {}:{} 失败: {}", hook.name(), entity, record.id, e);
                }
            }

            self.notifier.notify(&ChangeNotification::from_record(
                entity,
                record,
                change_set.metadata.source,
                change_set.metadata.batch_id,
            ));
        }

        Ok(summary)
    }

    /// 依赖实体按各自优先级入队；同一次触发内每个依赖只入队一次，暂停的依赖跳过
    fn cascade(&self, entity: EntityType) -> Vec<EntityType> {
        let Some(config) = self.configs.get(&entity) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut cascaded = Vec::new();
        for dependent in &config.dependencies {
            if !seen.insert(*dependent) {
                continue;
            }
            let Some(dependent_config) = self.configs.get(dependent) else {
                warn!("{} 的依赖 {} 未配置，跳过级联", entity, dependent);
                continue;
            };
            if self.states.is_paused(*dependent) {
                debug!("依赖 {} 已暂停，跳过级联", dependent);
                continue;
            }
            self.queue
                .enqueue(*dependent, dependent_config.priority, TaskOrigin::Cascade);
            cascaded.push(*dependent);
        }
        cascaded
    }
}
