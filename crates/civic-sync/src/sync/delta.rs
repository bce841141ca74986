//! 增量拉取
//!
//! 以高水位为界向数据源请求 `incremental_field > 水位` 的记录，按增量字段升序，
//! 归一化为 ChangeSet。缓存中已有的 id 记为 update，否则为 create。
//! 同一条记录可能被拉取多次（至少一次语义），应用端是幂等的。

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::change::{ChangeKind, ChangeRecord, ChangeSet, ChangeSource};
use super::entity_config::SyncConfig;
use super::payload::{format_watermark, EntityPayload};
use super::EntityType;
use crate::cache::EntityCache;
use crate::error::{CivicSyncError, Result};
use crate::provider::{PageQuery, ProviderRegistry};

/// 全量列举 id 时的最大页数
const MAX_LISTING_PAGES: usize = 1000;

pub struct DeltaFetcher {
    configs: Arc<HashMap<EntityType, SyncConfig>>,
    providers: ProviderRegistry,
    cache: Arc<dyn EntityCache>,
}

impl DeltaFetcher {
    pub fn new(
        configs: Arc<HashMap<EntityType, SyncConfig>>,
        providers: ProviderRegistry,
        cache: Arc<dyn EntityCache>,
    ) -> Self {
        Self {
            configs,
            providers,
            cache,
        }
    }

    fn config(&self, entity: EntityType) -> Result<&SyncConfig> {
        self.configs
            .get(&entity)
            .ok_or_else(|| CivicSyncError::Config(format!("实体 {} 未配置", entity)))
    }

    /// 拉取水位之后的变更；没有新数据或 endpoint 仍带路径参数时返回 None
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        entity: EntityType,
        high_water_mark: Option<DateTime<Utc>>,
    ) -> Result<Option<ChangeSet>> {
        let config = self.config(entity)?;
        if !config.is_schedulable() {
            debug!(
                "endpoint 模板含未解析参数 {:?}，跳过: {}",
                config.unresolved_params(),
                config.endpoint_template
            );
            return Ok(None);
        }
        self.fetch_endpoint(config, &config.endpoint_template, high_water_mark)
            .await
    }

    /// 用父级参数解析 endpoint 后拉取（例如某个法案下的动作）
    pub async fn fetch_scoped(
        &self,
        entity: EntityType,
        params: &HashMap<String, String>,
        high_water_mark: Option<DateTime<Utc>>,
    ) -> Result<Option<ChangeSet>> {
        let config = self.config(entity)?;
        let endpoint = config.resolve_endpoint(params)?;
        self.fetch_endpoint(config, &endpoint, high_water_mark).await
    }

    async fn fetch_endpoint(
        &self,
        config: &SyncConfig,
        endpoint: &str,
        high_water_mark: Option<DateTime<Utc>>,
    ) -> Result<Option<ChangeSet>> {
        let entity = config.entity_type;
        let provider = self
            .providers
            .provider_for(entity)
            .ok_or_else(|| CivicSyncError::Config(format!("实体 {} 没有可用的数据源", entity)))?;

        let mut query = PageQuery::ascending(&config.incremental_field, config.batch_size);
        if let Some(mark) = high_water_mark {
            query = query.with_filter(&config.incremental_field, format_watermark(&mark));
        }

        let page = provider.fetch_page(endpoint, &query).await?;
        if page.results.is_empty() {
            debug!("{} 无新数据", entity);
            return Ok(None);
        }

        let mut records = Vec::with_capacity(page.results.len());
        for raw in page.results {
            let payload = match EntityPayload::from_value(entity, raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!("跳过无法解析的 {} 记录: {}", entity, e);
                    continue;
                }
            };
            let timestamp = payload.incremental_value(&config.incremental_field);
            let kind = if self.cache.contains(entity, payload.id()).await? {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            };
            records.push(ChangeRecord::upsert(kind, payload, timestamp));
        }

        // 数据源未必遵守排序参数，这里稳定排序兜底
        records.sort_by_key(|r| r.timestamp);

        let change_set = ChangeSet::new(entity, records, ChangeSource::ApiIncremental);
        debug!(
            "{} 拉取到 {} 条变更, batch_id={}",
            entity,
            change_set.len(),
            change_set.metadata.batch_id
        );
        if change_set.is_empty() {
            return Ok(None);
        }
        Ok(Some(change_set))
    }

    /// 按增量字段翻页列举数据源当前的全部 id（对账用）
    pub async fn list_upstream_ids(&self, entity: EntityType) -> Result<HashSet<String>> {
        let config = self.config(entity)?;
        if !config.is_schedulable() {
            return Err(CivicSyncError::UnresolvedEndpoint {
                entity,
                template: config.endpoint_template.clone(),
            });
        }
        let provider = self
            .providers
            .provider_for(entity)
            .ok_or_else(|| CivicSyncError::Config(format!("实体 {} 没有可用的数据源", entity)))?;

        let mut ids = HashSet::new();
        let mut cursor: Option<DateTime<Utc>> = None;
        for _ in 0..MAX_LISTING_PAGES {
            let mut query = PageQuery::ascending(&config.incremental_field, config.batch_size);
            if let Some(mark) = cursor {
                query = query.with_filter(&config.incremental_field, format_watermark(&mark));
            }
            let page = provider.fetch_page(&config.endpoint_template, &query).await?;
            let full_page = page.results.len() >= config.batch_size as usize;

            let mut stamps = Vec::with_capacity(page.results.len());
            let mut unstamped = 0usize;
            for raw in page.results {
                let payload = EntityPayload::from_value(entity, raw)?;
                match payload.incremental_value(&config.incremental_field) {
                    Some(ts) => stamps.push(ts),
                    None => unstamped += 1,
                }
                ids.insert(payload.id().to_string());
            }

            if !full_page {
                return Ok(ids);
            }
            // 满页却无法继续翻页时列举不完整，不能据此判定删除
            if unstamped > 0 {
                return Err(CivicSyncError::InvalidData(format!(
                    "{} 有 {} 条记录缺少可解析的 {}，无法完整列举",
                    entity, unstamped, config.incremental_field
                )));
            }
            // 最大时间戳上的同值记录可能跨页，下一页从次大时间戳之后重取
            let page_max = stamps.iter().max().copied();
            let next = stamps
                .iter()
                .copied()
                .filter(|ts| Some(*ts) != page_max)
                .max();
            match next {
                Some(next) if cursor.map_or(true, |c| next > c) => cursor = Some(next),
                _ => {
                    return Err(CivicSyncError::InvalidData(format!(
                        "{} 同一 {} 值的记录超过一页，无法完整列举",
                        entity, config.incremental_field
                    )))
                }
            }
        }
        Err(CivicSyncError::Other(format!(
            "{} 列举超过 {} 页，放弃对账",
            entity, MAX_LISTING_PAGES
        )))
    }
}
