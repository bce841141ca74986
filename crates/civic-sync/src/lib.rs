//! civic-sync - 立法数据增量同步引擎
//!
//! 让本地实体缓存（法案、法案动作、委员会、代表、公众参与活动）与远端数据源保持一致：
//! - 按实体类型定时调度，单一排空循环按优先级串行执行
//! - 基于水位（增量字段最大值）的增量拉取
//! - 变更应用、二级搜索索引刷新、订阅通知、依赖实体的一跳级联
//! - 实时推送通道，断线自动重连
//! - 失败指数退避重试，同步状态周期持久化
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use civic_sync::{EntityType, HttpProviderConfig, SyncEngine, SyncEngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncEngineConfig::builder()
//!         .data_dir("/var/lib/civic-sync")
//!         .http(HttpProviderConfig {
//!             base_url: "https://api.example.org/v1".to_string(),
//!             ..Default::default()
//!         })
//!         .realtime_url("wss://push.example.org/changes")
//!         .build();
//!
//!     let engine = SyncEngine::builder(config).build().await?;
//!     engine.schedule_all()?;
//!
//!     let _handle = engine.subscribe(EntityType::Bills, None, |change| {
//!         println!("{} {} {}", change.entity, change.kind, change.id);
//!     });
//!
//!     if let Some(changes) = engine.force_sync(EntityType::Committees).await {
//!         println!("同步了 {} 条委员会变更", changes.len());
//!     }
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod version;
pub mod config;
pub mod logging;
pub mod storage;
pub mod cache;
pub mod provider;
pub mod sync;
pub mod realtime;
pub mod engine;
pub mod utils;

pub use error::{CivicSyncError, Result};
pub use config::{SyncEngineConfig, SyncEngineConfigBuilder};
pub use logging::init_logging;
pub use storage::KvStore;
pub use cache::{EntityCache, EntityCacheConfig, KvEntityCache, MemoryEntityCache};
pub use provider::{DataProvider, HttpDataProvider, HttpProviderConfig, PageQuery, PageResponse, ProviderRegistry};
pub use sync::{
    ChangeHook, ChangeKind, ChangeNotification, ChangeRecord, ChangeSet, ChangeSource, EntityPayload, EntityType,
    RetryPolicy, SubscriptionHandle, SyncConfig, SyncPriority, SyncState, SyncStatus,
};
pub use realtime::{
    BridgeState, ChannelTransport, ChannelTransportHandle, RealtimeConnection, RealtimeTransport,
    WebSocketTransport,
};
pub use engine::{SyncEngine, SyncEngineBuilder};
