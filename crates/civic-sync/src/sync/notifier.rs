//! 订阅通知
//!
//! 两种消费方式：
//! - 按实体类型（可选实体 id）注册回调，返回句柄用于取消订阅
//! - 订阅 broadcast 流，接收全部变更通知
//!
//! 单个回调 panic 只影响它自己，其余订阅者照常收到通知。

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

use super::change::{ChangeKind, ChangeRecord, ChangeSource};
use super::payload::EntityPayload;
use super::EntityType;
use crate::error::CivicSyncError;

/// 单条已应用变更的通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
    pub entity: EntityType,
    pub id: String,
    pub kind: ChangeKind,
    pub data: Option<EntityPayload>,
    pub source: ChangeSource,
    pub batch_id: Uuid,
    pub applied_at: DateTime<Utc>,
}

impl ChangeNotification {
    pub fn from_record(entity: EntityType, record: &ChangeRecord, source: ChangeSource, batch_id: Uuid) -> Self {
        Self {
            entity,
            id: record.id.clone(),
            kind: record.kind,
            data: record.data.clone(),
            source,
            batch_id,
            applied_at: Utc::now(),
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

struct Subscription {
    id: u64,
    entity: EntityType,
    entity_id: Option<String>,
    callback: ChangeCallback,
}

impl Subscription {
    fn matches(&self, notification: &ChangeNotification) -> bool {
        self.entity == notification.entity
            && self
                .entity_id
                .as_deref()
                .map_or(true, |id| id == notification.id)
    }
}

/// 通知统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifierStats {
    /// 总通知数
    pub total_notifications: u64,
    /// 按实体类型分组的通知数
    pub notifications_by_entity: HashMap<EntityType, u64>,
    /// 回调调用次数
    pub callbacks_invoked: u64,
    /// 回调 panic 次数
    pub callback_failures: u64,
    /// 当前订阅数
    pub subscription_count: usize,
}

#[derive(Default)]
struct Registry {
    subscriptions: RwLock<Vec<Subscription>>,
    stats: RwLock<NotifierStats>,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        let removed = subscriptions.len() != before;
        self.stats.write().subscription_count = subscriptions.len();
        removed
    }
}

/// 订阅句柄；丢弃句柄不会取消订阅，需要显式调用 [`SubscriptionHandle::unsubscribe`]
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消订阅，返回订阅是否仍然存在
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }
}

pub struct SubscriptionNotifier {
    registry: Arc<Registry>,
    sender: broadcast::Sender<ChangeNotification>,
    next_id: AtomicU64,
}

impl SubscriptionNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            registry: Arc::new(Registry::default()),
            sender,
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅实体类型的变更；`entity_id` 为空时接收该类型全部变更
    pub fn subscribe<F>(&self, entity: EntityType, entity_id: Option<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscriptions = self.registry.subscriptions.write();
        subscriptions.push(Subscription {
            id,
            entity,
            entity_id,
            callback: Arc::new(callback),
        });
        self.registry.stats.write().subscription_count = subscriptions.len();
        debug!("新增订阅 #{}: entity={}", id, entity);

        SubscriptionHandle {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// 订阅全部变更的广播流
    pub fn subscribe_stream(&self) -> broadcast::Receiver<ChangeNotification> {
        self.sender.subscribe()
    }

    /// 向匹配的订阅者分发通知，返回成功调用的回调数
    pub fn notify(&self, notification: &ChangeNotification) -> usize {
        // 先拷出回调再调用，回调内可以安全地订阅/取消订阅
        let callbacks: Vec<(u64, ChangeCallback)> = self
            .registry
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.matches(notification))
            .map(|s| (s.id, s.callback.clone()))
            .collect();

        let mut delivered = 0;
        let mut failures = 0;
        for (id, callback) in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    failures += 1;
                    let err = CivicSyncError::Callback(panic_message(panic.as_ref()));
                    error!(
                        "订阅 #{} 处理 {}:{} 变更时失败: {}",
                        id, notification.entity, notification.id, err
                    );
                }
            }
        }

        {
            let mut stats = self.registry.stats.write();
            stats.total_notifications += 1;
            *stats
                .notifications_by_entity
                .entry(notification.entity)
                .or_insert(0) += 1;
            stats.callbacks_invoked += callbacks.len() as u64;
            stats.callback_failures += failures;
        }

        // 没有接收者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(notification.clone()) {
            debug!("广播变更通知失败 (no active receivers): {}", e);
        }

        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscriptions.read().len()
    }

    pub fn stats(&self) -> NotifierStats {
        self.registry.stats.read().clone()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
