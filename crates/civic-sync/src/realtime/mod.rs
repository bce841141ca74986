//! 实时推送通道
//!
//! 持久双工连接上收到的 `{entity, id, type, data}` 变更立即合并进缓存，
//! 绕过调度器的定时间隔，但和增量同步走同一条应用路径（缓存、订阅通知、级联）。
//! 断线后按固定延迟无限重连，重连由 [`RealtimeBridge`] 负责，传输层只管建连。

pub mod bridge;
pub mod channel;
pub mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CivicSyncError, Result};
use crate::sync::payload::deserialize_id;
use crate::sync::{ChangeKind, ChangeRecord, EntityPayload, EntityType};

pub use bridge::{BridgeState, BridgeStats, RealtimeBridge};
pub use channel::{ChannelTransport, ChannelTransportHandle};
pub use websocket::WebSocketTransport;

/// 一条已建立的推送连接
#[async_trait]
pub trait RealtimeConnection: Send {
    /// 下一条文本消息；连接关闭时返回 None
    async fn next_message(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>>;
}

/// 推送消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub entity: EntityType,
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RealtimeMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| CivicSyncError::InvalidData(format!("无法解析推送消息: {}", e)))
    }

    /// 转换为变更记录；create/update 必须带 data 对象，data 中的 id 缺省时取消息 id
    pub fn into_record(self, incremental_field: &str) -> Result<ChangeRecord> {
        if self.kind == ChangeKind::Delete {
            return Ok(ChangeRecord::delete(self.id, None));
        }

        let mut data = match self.data {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(CivicSyncError::InvalidData(format!(
                    "{}:{} 的 data 不是对象",
                    self.entity, self.id
                )))
            }
            None => {
                return Err(CivicSyncError::InvalidData(format!(
                    "{}:{} 的 {} 消息缺少 data",
                    self.entity, self.id, self.kind
                )))
            }
        };
        data.entry("id").or_insert_with(|| Value::String(self.id.clone()));

        let payload = EntityPayload::from_value(self.entity, Value::Object(data))?;
        if payload.id() != self.id {
            return Err(CivicSyncError::InvalidData(format!(
                "消息 id {} 与 data.id {} 不一致",
                self.id,
                payload.id()
            )));
        }
        let timestamp = payload.incremental_value(incremental_field);
        Ok(ChangeRecord::upsert(self.kind, payload, timestamp))
    }
}
