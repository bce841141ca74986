//! 进程内推送源
//!
//! 每次 `open()` 准备一条连接，传输层建连时按顺序取用；没有准备好的连接时建连失败，
//! 由桥接层按重连延迟重试。发送端全部 drop 后连接关闭。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{RealtimeConnection, RealtimeTransport};
use crate::error::{CivicSyncError, Result};

#[derive(Default)]
struct Shared {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
    attempts: AtomicUsize,
}

pub struct ChannelTransport {
    shared: Arc<Shared>,
}

/// 推送端句柄
#[derive(Clone)]
pub struct ChannelTransportHandle {
    shared: Arc<Shared>,
}

impl ChannelTransport {
    pub fn new() -> (Self, ChannelTransportHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            ChannelTransportHandle { shared },
        )
    }
}

impl ChannelTransportHandle {
    /// 准备一条新连接，返回其发送端
    pub fn open(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.pending.lock().push_back(rx);
        tx
    }

    /// 建连尝试次数（含失败）
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeTransport for ChannelTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let receiver = self.shared.pending.lock().pop_front();
        match receiver {
            Some(receiver) => Ok(Box::new(ChannelConnection { receiver })),
            None => Err(CivicSyncError::Transport("没有可用的推送连接".to_string())),
        }
    }
}

struct ChannelConnection {
    receiver: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl RealtimeConnection for ChannelConnection {
    async fn next_message(&mut self) -> Option<Result<String>> {
        self.receiver.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver.close();
        Ok(())
    }
}
