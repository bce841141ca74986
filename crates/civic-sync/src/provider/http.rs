//! HTTP 数据源 - 基于 reqwest 的分页拉取
//!
//! 查询参数渲染为 `limit`、`sort`、`direction`，增量过滤渲染为 `{field}_gt`，
//! 响应体读取 `results` 数组。

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use super::{DataProvider, PageQuery, PageResponse};
use crate::error::{CivicSyncError, Result};

/// HTTP 数据源配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// API 根地址，例如 `https://api.example.org/v1`
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 携带 API key 的请求头
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            api_key_header: default_api_key_header(),
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

pub struct HttpDataProvider {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpDataProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(CivicSyncError::Config("HTTP 数据源 base_url 不能为空".to_string()));
        }

        let mut builder = Client::builder().user_agent(concat!("civic-sync/", env!("CARGO_PKG_VERSION")));

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| CivicSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("HTTP 数据源已创建 (base_url: {})", config.base_url);

        Ok(Self { client, config })
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

/// 将分页查询渲染为 URL 查询参数
pub fn query_pairs(query: &PageQuery) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("limit".to_string(), query.limit.to_string()),
        ("sort".to_string(), query.order_by.clone()),
        ("direction".to_string(), query.order_direction.as_str().to_string()),
    ];
    if let (Some(field), Some(value)) = (&query.filter_field, &query.filter_value) {
        pairs.push((format!("{}_gt", field), value.clone()));
    }
    pairs
}

#[async_trait]
impl DataProvider for HttpDataProvider {
    async fn fetch_page(&self, endpoint: &str, query: &PageQuery) -> Result<PageResponse> {
        let url = self.url_for(endpoint);
        debug!("拉取数据页: {} {:?}", url, query);

        let mut request = self.client.get(&url).query(&query_pairs(query));
        if let Some(api_key) = &self.config.api_key {
            request = request.header(self.config.api_key_header.as_str(), api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CivicSyncError::Transport(format!("请求 {} 失败: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("数据源返回错误，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(CivicSyncError::Http {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let page: PageResponse = response
            .json()
            .await
            .map_err(|e| CivicSyncError::Serialization(format!("解析数据页失败: {}", e)))?;
        debug!("数据页返回 {} 条记录: {}", page.results.len(), url);
        Ok(page)
    }
}
