//! 实时通道桥接：连接生命周期与消息合并

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RealtimeConnection, RealtimeMessage, RealtimeTransport};
use crate::error::{CivicSyncError, Result};
use crate::sync::{ApplySummary, ChangeApplier, ChangeSet, ChangeSource, EntityType, SyncConfig};

/// 桥接连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeState::Disconnected => write!(f, "未连接"),
            BridgeState::Connecting => write!(f, "连接中"),
            BridgeState::Connected => write!(f, "已连接"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    /// 首次之后的建连尝试
    pub reconnects: u64,
    pub messages_applied: u64,
    /// 畸形或未配置实体的消息
    pub messages_dropped: u64,
    pub apply_failures: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

pub struct RealtimeBridge {
    transport: Arc<dyn RealtimeTransport>,
    applier: Arc<ChangeApplier>,
    configs: Arc<HashMap<EntityType, SyncConfig>>,
    reconnect_delay: Duration,
    state: watch::Sender<BridgeState>,
    stats: Mutex<BridgeStats>,
}

impl RealtimeBridge {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        applier: Arc<ChangeApplier>,
        configs: Arc<HashMap<EntityType, SyncConfig>>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        Self {
            transport,
            applier,
            configs,
            reconnect_delay,
            state,
            stats: Mutex::new(BridgeStats::default()),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.lock().clone()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("实时通道状态变化: {} -> {}", previous, state);
        }
    }

    /// 连接循环：断线后按固定延迟无限重连，直到 shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("实时通道启动, reconnect_delay={:?}", self.reconnect_delay);
        loop {
            self.set_state(BridgeState::Connecting);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(mut connection) => {
                    self.stats.lock().connects += 1;
                    self.set_state(BridgeState::Connected);
                    let stopped = self.pump(connection.as_mut(), &shutdown).await;
                    if let Err(e) = connection.close().await {
                        debug!("关闭推送连接失败: {}", e);
                    }
                    self.stats.lock().disconnects += 1;
                    self.set_state(BridgeState::Disconnected);
                    if stopped {
                        break;
                    }
                }
                Err(e) => {
                    self.stats.lock().connect_failures += 1;
                    warn!("实时通道连接失败: {}", e);
                    self.set_state(BridgeState::Disconnected);
                }
            }

            debug!("{:?} 后重连实时通道", self.reconnect_delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            self.stats.lock().reconnects += 1;
        }
        self.set_state(BridgeState::Disconnected);
        info!("实时通道已停止");
    }

    /// 读取消息直到连接断开；因 shutdown 退出时返回 true
    async fn pump(&self, connection: &mut dyn RealtimeConnection, shutdown: &CancellationToken) -> bool {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return true,
                next = connection.next_message() => next,
            };
            match next {
                Some(Ok(text)) => {
                    // 错误已在内部计数并记录
                    let _ = self.handle_message(&text).await;
                }
                Some(Err(e)) => {
                    warn!("推送连接读取失败: {}", e);
                    return false;
                }
                None => {
                    info!("推送连接已被对端关闭");
                    return false;
                }
            }
        }
    }

    /// 解析一条推送消息并作为单条变更集应用
    pub async fn handle_message(&self, text: &str) -> Result<ApplySummary> {
        self.stats.lock().last_message_at = Some(Utc::now());

        let change_set = match self.to_change_set(text) {
            Ok(change_set) => change_set,
            Err(e) => {
                self.stats.lock().messages_dropped += 1;
                warn!("丢弃畸形推送消息: {}", e);
                return Err(e);
            }
        };

        match self.applier.apply(&change_set).await {
            Ok(summary) => {
                self.stats.lock().messages_applied += 1;
                Ok(summary)
            }
            Err(e) => {
                self.stats.lock().apply_failures += 1;
                error!("应用 {} 推送变更失败: {}", change_set.entity, e);
                Err(e)
            }
        }
    }

    fn to_change_set(&self, text: &str) -> Result<ChangeSet> {
        let message = RealtimeMessage::parse(text)?;
        let entity = message.entity;
        let config = self
            .configs
            .get(&entity)
            .ok_or_else(|| CivicSyncError::InvalidData(format!("实体 {} 未配置同步", entity)))?;
        let record = message.into_record(&config.incremental_field)?;
        debug!("收到推送变更: {}:{} ({})", entity, record.id, record.kind);
        Ok(ChangeSet::new(entity, vec![record], ChangeSource::Realtime))
    }
}
