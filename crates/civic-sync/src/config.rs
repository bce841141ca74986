//! 同步引擎配置

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CivicSyncError, Result};
use crate::provider::HttpProviderConfig;
use crate::sync::{default_entity_configs, EntityType, RetryPolicy, SyncConfig};
use crate::utils::{duration_secs, option_duration_secs};

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEngineConfig {
    /// 数据目录（实体缓存与同步状态）
    pub data_dir: PathBuf,
    /// 排空循环节拍
    #[serde(with = "duration_secs")]
    pub drain_interval: Duration,
    /// 串行任务之间的间隔
    #[serde(with = "duration_secs")]
    pub inter_task_delay: Duration,
    /// 同步状态持久化周期
    #[serde(with = "duration_secs")]
    pub persist_interval: Duration,
    /// 关停时排空队列的上限
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub realtime_reconnect_delay: Duration,
    /// 实时推送地址（ws:// 或 wss://），为空时不启用实时通道
    pub realtime_url: Option<String>,
    /// 实体缓存 TTL（秒），0 表示不过期
    pub cache_ttl_secs: u64,
    pub error_history_limit: usize,
    /// 变更通知与完成事件的广播缓冲
    pub event_buffer_size: usize,
    pub retry: RetryPolicy,
    pub entities: Vec<SyncConfig>,
    /// 数据源 HTTP 配置；使用自定义 DataProvider 时可为空
    pub http: Option<HttpProviderConfig>,
    /// 对账清扫周期，None 表示关闭
    #[serde(with = "option_duration_secs")]
    pub reconcile_interval: Option<Duration>,
    pub debug_mode: bool,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            drain_interval: Duration::from_secs(5),
            inter_task_delay: Duration::from_secs(1),
            persist_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            realtime_reconnect_delay: Duration::from_secs(5),
            realtime_url: None,
            cache_ttl_secs: 24 * 60 * 60,
            error_history_limit: 10,
            event_buffer_size: 1000,
            retry: RetryPolicy::default(),
            entities: default_entity_configs(),
            http: None,
            reconcile_interval: None,
            debug_mode: false,
        }
    }
}

/// 默认数据目录 ~/.civic-sync/
fn default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".civic-sync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".civic-sync")
    } else {
        PathBuf::from("./civic_sync_data")
    }
}

impl SyncEngineConfig {
    pub fn builder() -> SyncEngineConfigBuilder {
        SyncEngineConfigBuilder::new()
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| CivicSyncError::Config(format!("配置解析失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CivicSyncError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    pub fn entity(&self, entity: EntityType) -> Option<&SyncConfig> {
        self.entities.iter().find(|c| c.entity_type == entity)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CivicSyncError::Config("数据目录不能为空".to_string()));
        }
        if self.drain_interval.is_zero() {
            return Err(CivicSyncError::Config("drain_interval 不能为 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(CivicSyncError::Config("event_buffer_size 不能为 0".to_string()));
        }
        if matches!(self.reconcile_interval, Some(d) if d.is_zero()) {
            return Err(CivicSyncError::Config("reconcile_interval 不能为 0".to_string()));
        }

        let mut seen = HashSet::new();
        for config in &self.entities {
            if !seen.insert(config.entity_type) {
                return Err(CivicSyncError::Config(format!("实体 {} 重复配置", config.entity_type)));
            }
            if config.batch_size == 0 {
                return Err(CivicSyncError::Config(format!("{} 的 batch_size 不能为 0", config.entity_type)));
            }
            if config.sync_interval.is_zero() {
                return Err(CivicSyncError::Config(format!("{} 的 sync_interval 不能为 0", config.entity_type)));
            }
            if config.endpoint_template.is_empty() {
                return Err(CivicSyncError::Config(format!("{} 的 endpoint 不能为空", config.entity_type)));
            }
        }

        for config in &self.entities {
            for dependency in &config.dependencies {
                if *dependency == config.entity_type {
                    return Err(CivicSyncError::Config(format!("{} 不能依赖自身", config.entity_type)));
                }
                if !seen.contains(dependency) {
                    return Err(CivicSyncError::Config(format!(
                        "{} 依赖未配置的实体 {}",
                        config.entity_type, dependency
                    )));
                }
            }
        }

        if let Some(url) = &self.realtime_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(CivicSyncError::Config(format!("无效的实时推送地址: {}", url)));
            }
        }
        Ok(())
    }
}

/// 同步引擎配置构建器
pub struct SyncEngineConfigBuilder {
    config: SyncEngineConfig,
}

impl Default for SyncEngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncEngineConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.config.drain_interval = interval;
        self
    }

    pub fn inter_task_delay(mut self, delay: Duration) -> Self {
        self.config.inter_task_delay = delay;
        self
    }

    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.config.persist_interval = interval;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn realtime_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.realtime_url = Some(url.into());
        self
    }

    pub fn realtime_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.realtime_reconnect_delay = delay;
        self
    }

    pub fn cache_ttl_secs(mut self, ttl: u64) -> Self {
        self.config.cache_ttl_secs = ttl;
        self
    }

    pub fn error_history_limit(mut self, limit: usize) -> Self {
        self.config.error_history_limit = limit;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// 替换整张实体同步表
    pub fn entities(mut self, entities: Vec<SyncConfig>) -> Self {
        self.config.entities = entities;
        self
    }

    /// 替换或追加单个实体的同步配置
    pub fn entity(mut self, config: SyncConfig) -> Self {
        match self
            .config
            .entities
            .iter_mut()
            .find(|c| c.entity_type == config.entity_type)
        {
            Some(existing) => *existing = config,
            None => self.config.entities.push(config),
        }
        self
    }

    pub fn http(mut self, config: HttpProviderConfig) -> Self {
        self.config.http = Some(config);
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile_interval = Some(interval);
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SyncEngineConfig {
        self.config
    }
}
