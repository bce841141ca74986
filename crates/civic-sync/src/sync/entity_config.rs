//! 实体同步配置（启动时加载，运行期只读）

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use super::priority::SyncPriority;
use super::EntityType;
use crate::error::{CivicSyncError, Result};
use crate::utils::duration_secs;

/// 单个实体类型的同步配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub entity_type: EntityType,
    /// 数据源 endpoint，可能包含 `{param}` 形式的路径参数
    pub endpoint_template: String,
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,
    pub batch_size: u32,
    pub priority: SyncPriority,
    /// 作为水位的增量字段名
    pub incremental_field: String,
    /// 本实体变更后需要级联同步的实体类型
    #[serde(default)]
    pub dependencies: Vec<EntityType>,
}

fn path_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("path param regex"))
}

impl SyncConfig {
    pub fn new(
        entity_type: EntityType,
        endpoint_template: impl Into<String>,
        sync_interval: Duration,
        priority: SyncPriority,
    ) -> Self {
        Self {
            entity_type,
            endpoint_template: endpoint_template.into(),
            sync_interval,
            batch_size: 100,
            priority,
            incremental_field: "updated_at".to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_incremental_field(mut self, field: impl Into<String>) -> Self {
        self.incremental_field = field.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<EntityType>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// endpoint 模板中未解析的路径参数名
    pub fn unresolved_params(&self) -> Vec<String> {
        path_param_regex()
            .captures_iter(&self.endpoint_template)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }

    /// 没有路径参数的实体才能参与定时增量同步
    pub fn is_schedulable(&self) -> bool {
        !path_param_regex().is_match(&self.endpoint_template)
    }

    /// 用父级参数解析 endpoint（例如 `bill_id`），缺参数时报错
    pub fn resolve_endpoint(&self, params: &HashMap<String, String>) -> Result<String> {
        let mut missing = Vec::new();
        let resolved = path_param_regex().replace_all(&self.endpoint_template, |caps: &regex::Captures| {
            let name = &caps[1];
            match params.get(name) {
                Some(value) => value.clone(),
                None => {
                    missing.push(name.to_string());
                    caps[0].to_string()
                }
            }
        });
        if !missing.is_empty() {
            return Err(CivicSyncError::UnresolvedEndpoint {
                entity: self.entity_type,
                template: self.endpoint_template.clone(),
            });
        }
        Ok(resolved.into_owned())
    }
}

/// 内置的实体同步表
pub fn default_entity_configs() -> Vec<SyncConfig> {
    vec![
        SyncConfig::new(
            EntityType::Bills,
            "bills",
            Duration::from_secs(15 * 60),
            SyncPriority::saturating(9),
        )
        .with_dependencies(vec![EntityType::BillActions]),
        // 依附于具体法案，只能通过父级 scoped 同步
        SyncConfig::new(
            EntityType::BillActions,
            "bills/{bill_id}/actions",
            Duration::from_secs(30 * 60),
            SyncPriority::saturating(7),
        )
        .with_batch_size(200)
        .with_incremental_field("action_date"),
        SyncConfig::new(
            EntityType::Committees,
            "committees",
            Duration::from_secs(6 * 60 * 60),
            SyncPriority::saturating(5),
        ),
        SyncConfig::new(
            EntityType::Representatives,
            "representatives",
            Duration::from_secs(24 * 60 * 60),
            SyncPriority::saturating(6),
        )
        .with_batch_size(500)
        .with_dependencies(vec![EntityType::Committees]),
        SyncConfig::new(
            EntityType::EngagementEvents,
            "engagement/events",
            Duration::from_secs(5 * 60),
            SyncPriority::saturating(4),
        )
        .with_batch_size(50),
    ]
}
