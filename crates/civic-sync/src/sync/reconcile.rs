//! 对账清扫（默认关闭）
//!
//! 增量拉取只能看到新增与更新，上游删除只通过实时推送传播。对账清扫周期性
//! 列举上游当前的全部 id，把缓存里上游已不存在的条目作为 delete 变更走正常的
//! 应用路径（订阅通知、搜索索引、级联）。清扫期间占用实体的 syncing 槽位。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::applier::ChangeApplier;
use super::change::{ChangeRecord, ChangeSet, ChangeSource};
use super::delta::DeltaFetcher;
use super::entity_config::SyncConfig;
use super::state::SyncStateRegistry;
use super::EntityType;
use crate::cache::EntityCache;
use crate::error::Result;

/// 单个实体的清扫结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// 删除的过期条目数
    Swept(usize),
    /// 实体正在同步或已暂停
    Busy,
}

pub struct ReconcileSweep {
    configs: Arc<HashMap<EntityType, SyncConfig>>,
    fetcher: Arc<DeltaFetcher>,
    cache: Arc<dyn EntityCache>,
    applier: Arc<ChangeApplier>,
    states: Arc<SyncStateRegistry>,
}

impl ReconcileSweep {
    pub fn new(
        configs: Arc<HashMap<EntityType, SyncConfig>>,
        fetcher: Arc<DeltaFetcher>,
        cache: Arc<dyn EntityCache>,
        applier: Arc<ChangeApplier>,
        states: Arc<SyncStateRegistry>,
    ) -> Self {
        Self {
            configs,
            fetcher,
            cache,
            applier,
            states,
        }
    }

    pub async fn sweep(&self, entity: EntityType) -> Result<SweepOutcome> {
        if !self.states.begin_exclusive(entity) {
            return Ok(SweepOutcome::Busy);
        }
        let result = self.sweep_locked(entity).await;
        self.states.end_exclusive(entity);
        result.map(SweepOutcome::Swept)
    }

    async fn sweep_locked(&self, entity: EntityType) -> Result<usize> {
        let upstream = self.fetcher.list_upstream_ids(entity).await?;
        let mut stale: Vec<String> = self
            .cache
            .keys(entity)
            .await?
            .into_iter()
            .filter(|id| !upstream.contains(id))
            .collect();
        if stale.is_empty() {
            debug!("{} 对账无差异", entity);
            return Ok(0);
        }
        stale.sort();

        let records = stale
            .into_iter()
            .map(|id| ChangeRecord::delete(id, None))
            .collect();
        let change_set = ChangeSet::new(entity, records, ChangeSource::Reconcile);
        let summary = self.applier.apply(&change_set).await?;
        info!("{} 对账删除 {} 条上游已不存在的记录", entity, summary.deleted);
        Ok(summary.deleted)
    }

    /// 清扫全部可调度实体，单个实体失败不影响其他实体
    pub async fn sweep_all(&self) -> usize {
        let mut entities: Vec<EntityType> = self
            .configs
            .values()
            .filter(|c| c.is_schedulable())
            .map(|c| c.entity_type)
            .collect();
        entities.sort();

        let mut total = 0;
        for entity in entities {
            match self.sweep(entity).await {
                Ok(SweepOutcome::Swept(n)) => total += n,
                Ok(SweepOutcome::Busy) => debug!("{} 忙，跳过本轮对账", entity),
                Err(e) => warn!("{} 对账失败: {}", entity, e),
            }
        }
        total
    }

    /// 周期清扫循环，直到 shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!("对账清扫启动, interval={:?}", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep_all().await;
        }
    }
}
