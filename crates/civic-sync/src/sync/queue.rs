//! 全局同步任务队列
//!
//! 按优先级降序、同优先级按入队时间 FIFO 排列。入队做线性扫描插入，
//! 队列长度与实体类型数同一量级，不需要堆结构。同一实体可以同时存在多个任务，
//! 重复的任务在执行时被 syncing 守卫或空变更集自然吸收。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::debug;

use super::priority::SyncPriority;
use super::EntityType;

/// 任务来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    Scheduled,
    Cascade,
    Retry,
    Manual,
}

/// 同步任务，出队即销毁
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub entity: EntityType,
    pub priority: SyncPriority,
    pub enqueued_at: Instant,
    pub origin: TaskOrigin,
    /// 入队序号，同一 Instant 下仍能保持 FIFO
    pub seq: u64,
}

/// 队列快照项（状态查询用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedTaskInfo {
    pub entity: EntityType,
    pub priority: SyncPriority,
    pub origin: TaskOrigin,
}

#[derive(Debug, Default)]
pub struct SyncQueue {
    tasks: Mutex<VecDeque<SyncTask>>,
    next_seq: AtomicU64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，返回任务序号
    pub fn enqueue(&self, entity: EntityType, priority: SyncPriority, origin: TaskOrigin) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = SyncTask {
            entity,
            priority,
            enqueued_at: Instant::now(),
            origin,
            seq,
        };

        let mut tasks = self.tasks.lock();
        // 第一个优先级严格更低的位置；同优先级排在已有任务之后
        let position = tasks
            .iter()
            .position(|queued| priority.is_higher_than(queued.priority))
            .unwrap_or(tasks.len());
        tasks.insert(position, task);
        debug!(
            "入队同步任务: entity={}, priority={}, origin={:?}, position={}, queue_len={}",
            entity,
            priority,
            origin,
            position,
            tasks.len()
        );
        seq
    }

    /// 取出最高优先级任务
    pub fn dequeue(&self) -> Option<SyncTask> {
        self.tasks.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn contains(&self, entity: EntityType) -> bool {
        self.tasks.lock().iter().any(|t| t.entity == entity)
    }

    /// 指定实体在队列中的任务数
    pub fn count(&self, entity: EntityType) -> usize {
        self.tasks.lock().iter().filter(|t| t.entity == entity).count()
    }

    pub fn snapshot(&self) -> Vec<QueuedTaskInfo> {
        self.tasks
            .lock()
            .iter()
            .map(|t| QueuedTaskInfo {
                entity: t.entity,
                priority: t.priority,
                origin: t.origin,
            })
            .collect()
    }

    pub fn clear(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let n = tasks.len();
        tasks.clear();
        n
    }
}
