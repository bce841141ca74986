//! 数据源客户端接口
//!
//! 引擎只依赖 [`DataProvider::fetch_page`]；每个实体类型可以挂在不同的数据源上，
//! 未单独注册的实体使用默认数据源。

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::sync::EntityType;

pub use http::{HttpDataProvider, HttpProviderConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderDirection::Asc => "asc",
            OrderDirection::Desc => "desc",
        }
    }
}

/// 单页查询参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageQuery {
    pub limit: u32,
    pub order_by: String,
    pub order_direction: OrderDirection,
    /// 过滤条件：`filter_field > filter_value`，首次同步时为空
    pub filter_field: Option<String>,
    pub filter_value: Option<String>,
}

impl PageQuery {
    pub fn ascending(order_by: impl Into<String>, limit: u32) -> Self {
        Self {
            limit,
            order_by: order_by.into(),
            order_direction: OrderDirection::Asc,
            filter_field: None,
            filter_value: None,
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_field = Some(field.into());
        self.filter_value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    #[serde(default)]
    pub results: Vec<Value>,
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch_page(&self, endpoint: &str, query: &PageQuery) -> Result<PageResponse>;
}

/// 实体类型 → 数据源
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    default: Option<Arc<dyn DataProvider>>,
    overrides: HashMap<EntityType, Arc<dyn DataProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(provider: Arc<dyn DataProvider>) -> Self {
        Self {
            default: Some(provider),
            overrides: HashMap::new(),
        }
    }

    pub fn set_default(&mut self, provider: Arc<dyn DataProvider>) {
        self.default = Some(provider);
    }

    pub fn register(&mut self, entity: EntityType, provider: Arc<dyn DataProvider>) {
        self.overrides.insert(entity, provider);
    }

    pub fn provider_for(&self, entity: EntityType) -> Option<Arc<dyn DataProvider>> {
        self.overrides
            .get(&entity)
            .cloned()
            .or_else(|| self.default.clone())
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.overrides.is_empty()
    }
}
