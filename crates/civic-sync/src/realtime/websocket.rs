//! WebSocket 推送连接

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{RealtimeConnection, RealtimeTransport};
use crate::error::{CivicSyncError, Result};

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(CivicSyncError::Config(format!("无效的 WebSocket 地址: {}", url)));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| CivicSyncError::Transport(format!("WebSocket 连接失败: {}", e)))?;
        info!("WebSocket 已连接: {} (status={})", self.url, response.status());
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    async fn next_message(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(CivicSyncError::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.to_string())),
                // 非 UTF-8 内容会在解析阶段被当作畸形消息丢弃
                Message::Binary(bytes) => return Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Message::Ping(payload) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        return Some(Err(CivicSyncError::Transport(e.to_string())));
                    }
                }
                Message::Close(frame) => {
                    debug!("收到 Close 帧: {:?}", frame);
                    return None;
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| CivicSyncError::Transport(e.to_string()))
    }
}
