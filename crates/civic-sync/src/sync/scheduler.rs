//! 同步调度器
//!
//! 每个实体类型一个定时任务：单调时钟上记录下一次触发时间，触发后入队并
//! 以触发完成时刻重新计算下一次，慢节拍不会叠加。取消通过 CancellationToken。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::entity_config::SyncConfig;
use super::queue::{SyncQueue, TaskOrigin};
use super::state::SyncStateRegistry;
use super::EntityType;

pub struct SyncScheduler {
    configs: Arc<HashMap<EntityType, SyncConfig>>,
    queue: Arc<SyncQueue>,
    states: Arc<SyncStateRegistry>,
    root: CancellationToken,
    timers: Mutex<HashMap<EntityType, CancellationToken>>,
}

impl SyncScheduler {
    pub fn new(
        configs: Arc<HashMap<EntityType, SyncConfig>>,
        queue: Arc<SyncQueue>,
        states: Arc<SyncStateRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            configs,
            queue,
            states,
            root: shutdown,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// 为所有可调度、未暂停的实体启动定时器，返回启动数量
    pub fn schedule_all(&self) -> usize {
        let mut entities: Vec<EntityType> = self.configs.keys().copied().collect();
        entities.sort();
        let armed = entities
            .into_iter()
            .filter(|entity| !self.states.is_paused(*entity))
            .filter(|entity| self.arm(*entity))
            .count();
        info!("已启动 {} 个实体的同步定时器", armed);
        armed
    }

    /// 启动（或重启）单个实体的定时器
    ///
    /// endpoint 仍带路径参数的实体不参与定时同步，返回 false。
    pub fn arm(&self, entity: EntityType) -> bool {
        let Some(config) = self.configs.get(&entity) else {
            return false;
        };
        if !config.is_schedulable() {
            debug!("{} 的 endpoint 需要父级参数，不启动定时器", entity);
            return false;
        }
        if self.root.is_cancelled() {
            return false;
        }

        let token = self.root.child_token();
        if let Some(previous) = self.timers.lock().insert(entity, token.clone()) {
            previous.cancel();
        }

        let interval = config.sync_interval;
        let priority = config.priority;
        let queue = self.queue.clone();
        let states = self.states.clone();
        tokio::spawn(async move {
            let mut next_fire = Instant::now() + interval;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep_until(next_fire) => {}
                }
                if !states.is_paused(entity) {
                    queue.enqueue(entity, priority, TaskOrigin::Scheduled);
                }
                next_fire = Instant::now() + interval;
            }
            debug!("{} 定时器已停止", entity);
        });
        debug!("{} 定时器已启动, interval={:?}", entity, interval);
        true
    }

    /// 取消实体的后续触发；已入队的任务不受影响
    pub fn disarm(&self, entity: EntityType) -> bool {
        match self.timers.lock().remove(&entity) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, entity: EntityType) -> bool {
        self.timers.lock().contains_key(&entity)
    }

    pub fn armed_entities(&self) -> Vec<EntityType> {
        let mut entities: Vec<EntityType> = self.timers.lock().keys().copied().collect();
        entities.sort();
        entities
    }

    pub fn disarm_all(&self) {
        for (_, token) in self.timers.lock().drain() {
            token.cancel();
        }
    }
}
