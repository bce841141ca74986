//! 同步执行器
//!
//! 单一排空循环：按固定节奏醒来，串行取出最高优先级任务执行 `perform_sync`，
//! 任务之间固定间隔。`is_draining` 保证排空循环不会与自身并行。
//!
//! `perform_sync` 状态机：idle → syncing → {idle, error}
//! - 已在 syncing：立即放弃
//! - 拉取 → 应用 → 推进水位 → 级联
//! - 失败：error_count += 1，未达上限时按退避延迟以降一级优先级重新入队

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::applier::ChangeApplier;
use super::change::ChangeSet;
use super::delta::DeltaFetcher;
use super::priority::SyncPriority;
use super::queue::{SyncQueue, SyncTask, TaskOrigin};
use super::retry::{RetryPolicy, SyncFailureKind};
use super::state::SyncStateRegistry;
use super::EntityType;

/// 单次同步的结果
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Synced {
        /// 没有新数据时为 None
        change_set: Option<ChangeSet>,
        applied: usize,
    },
    Failed {
        error: String,
        /// 已安排的重试延迟
        retry_in: Option<Duration>,
    },
    /// 同一实体已在同步中
    Skipped,
}

/// 同步完成事件
#[derive(Debug, Clone)]
pub struct SyncCompletion {
    pub entity: EntityType,
    /// 对应队列任务的序号，直接调用 perform_sync 时为 None
    pub seq: Option<u64>,
    pub outcome: SyncOutcome,
}

/// 执行器统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub tasks_processed: u64,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    pub syncs_skipped: u64,
    pub records_applied: u64,
    pub retries_scheduled: u64,
    /// 应用了记录却没有可解析增量字段的批次，水位因此不前进
    pub batches_without_watermark: u64,
    pub last_drain_at: Option<DateTime<Utc>>,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncExecutor {
    queue: Arc<SyncQueue>,
    states: Arc<SyncStateRegistry>,
    fetcher: Arc<DeltaFetcher>,
    applier: Arc<ChangeApplier>,
    retry_policy: RetryPolicy,
    inter_task_delay: Duration,
    is_draining: AtomicBool,
    completions: broadcast::Sender<SyncCompletion>,
    wake: Arc<Notify>,
    /// 停止定时排空与待触发的重试
    shutdown: CancellationToken,
    /// 关停排空结束后取消，等待中的 force_sync 随之返回
    closed: CancellationToken,
    stats: Mutex<ExecutorStats>,
}

impl SyncExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<SyncQueue>,
        states: Arc<SyncStateRegistry>,
        fetcher: Arc<DeltaFetcher>,
        applier: Arc<ChangeApplier>,
        retry_policy: RetryPolicy,
        inter_task_delay: Duration,
        event_buffer_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (completions, _) = broadcast::channel(event_buffer_size.max(1));
        Self {
            queue,
            states,
            fetcher,
            applier,
            retry_policy,
            inter_task_delay,
            is_draining: AtomicBool::new(false),
            completions,
            wake: Arc::new(Notify::new()),
            shutdown,
            closed: CancellationToken::new(),
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining.load(Ordering::Acquire)
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<SyncCompletion> {
        self.completions.subscribe()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().clone()
    }

    /// 唤醒排空循环，不等下一个节拍
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 排空循环：每个节拍（或被唤醒时）排空一次队列，直到 shutdown
    pub async fn run(self: Arc<Self>, drain_interval: Duration) {
        info!("同步执行器启动, drain_interval={:?}", drain_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(drain_interval) => {}
                _ = self.wake.notified() => {}
            }
            self.drain().await;
        }
        info!("同步执行器排空循环已停止");
    }

    /// 串行排空队列，返回执行的任务数；已有排空在进行时直接返回 0
    pub async fn drain(&self) -> usize {
        if self.is_draining.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let _guard = DrainGuard(&self.is_draining);

        let mut processed = 0;
        while let Some(task) = self.queue.dequeue() {
            self.run_task(task).await;
            processed += 1;
            if !self.queue.is_empty() {
                tokio::time::sleep(self.inter_task_delay).await;
            }
        }
        if processed > 0 {
            debug!("本轮排空执行 {} 个任务", processed);
        }
        self.stats.lock().last_drain_at = Some(Utc::now());
        processed
    }

    /// 关停时调用：反复排空直到队列为空且没有排空在进行
    pub async fn drain_until_empty(&self) {
        loop {
            self.drain().await;
            if self.queue.is_empty() && !self.is_draining() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// 标记执行器已关闭，等待中的 force_sync 返回 None
    pub fn close(&self) {
        self.closed.cancel();
    }

    async fn run_task(&self, task: SyncTask) {
        debug!(
            "执行同步任务: entity={}, priority={}, origin={:?}, waited={:?}",
            task.entity,
            task.priority,
            task.origin,
            task.enqueued_at.elapsed()
        );
        self.stats.lock().tasks_processed += 1;
        let outcome = self.perform_sync(task.entity, task.priority).await;
        // 没有订阅者时 send 失败属正常
        let _ = self.completions.send(SyncCompletion {
            entity: task.entity,
            seq: Some(task.seq),
            outcome,
        });
    }

    /// 执行一次增量同步
    pub async fn perform_sync(&self, entity: EntityType, priority: SyncPriority) -> SyncOutcome {
        let Some(high_water_mark) = self.states.try_begin(entity) else {
            debug!("{} 已在同步中，放弃本次任务", entity);
            self.stats.lock().syncs_skipped += 1;
            return SyncOutcome::Skipped;
        };

        let change_set = match self.fetcher.fetch(entity, high_water_mark).await {
            Ok(change_set) => change_set,
            Err(e) => {
                let kind = SyncFailureKind::classify_fetch(&e);
                return self.handle_failure(entity, priority, kind, e.to_string());
            }
        };

        let Some(change_set) = change_set else {
            self.states.finish_success(entity, 0, None);
            self.stats.lock().syncs_succeeded += 1;
            return SyncOutcome::Synced {
                change_set: None,
                applied: 0,
            };
        };

        match self.applier.apply(&change_set).await {
            Ok(summary) => {
                let applied = summary.applied();
                let without_watermark = applied > 0 && summary.high_water_mark.is_none();
                self.states
                    .finish_success(entity, applied, summary.high_water_mark);
                {
                    let mut stats = self.stats.lock();
                    stats.syncs_succeeded += 1;
                    stats.records_applied += applied as u64;
                    if without_watermark {
                        stats.batches_without_watermark += 1;
                    }
                }
                if without_watermark {
                    warn!(
                        "{} 本批 {} 条记录都没有可解析的增量字段，水位不前进，下次会重新拉取同一批",
                        entity, applied
                    );
                }
                info!(
                    "{} 同步完成: applied={}, high_water_mark={:?}",
                    entity, applied, summary.high_water_mark
                );
                SyncOutcome::Synced {
                    change_set: Some(change_set),
                    applied,
                }
            }
            Err(e) => self.handle_failure(entity, priority, SyncFailureKind::Apply, e.to_string()),
        }
    }

    fn handle_failure(
        &self,
        entity: EntityType,
        priority: SyncPriority,
        kind: SyncFailureKind,
        message: String,
    ) -> SyncOutcome {
        self.stats.lock().syncs_failed += 1;
        let Some(outcome) = self.states.finish_error(entity, message.clone()) else {
            return SyncOutcome::Failed {
                error: message,
                retry_in: None,
            };
        };

        let retry_in = if outcome.paused || !self.retry_policy.should_retry(outcome.error_count, kind) {
            None
        } else {
            self.retry_policy.next_retry_delay(outcome.error_count)
        };

        match retry_in {
            Some(delay) => {
                warn!(
                    "{} 同步失败 (第 {} 次, {:?}): {}，{:?} 后重试",
                    entity, outcome.error_count, kind, message, delay
                );
                self.schedule_retry(entity, priority.lowered(), delay);
            }
            None => error!(
                "{} 同步失败 (第 {} 次, {:?}): {}，不再重试",
                entity, outcome.error_count, kind, message
            ),
        }

        SyncOutcome::Failed {
            error: message,
            retry_in,
        }
    }

    fn schedule_retry(&self, entity: EntityType, priority: SyncPriority, delay: Duration) {
        self.stats.lock().retries_scheduled += 1;
        let queue = self.queue.clone();
        let states = self.states.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("关停中，取消 {} 的重试", entity);
                }
                _ = tokio::time::sleep(delay) => {
                    if states.is_paused(entity) {
                        debug!("{} 已暂停，丢弃重试", entity);
                        return;
                    }
                    queue.enqueue(entity, priority, TaskOrigin::Retry);
                }
            }
        });
    }

    /// 以最高优先级入队并等待该任务完成
    ///
    /// 返回本次拉取并应用的变更集；失败、没有新数据或执行器已关闭时返回 None。
    pub async fn force_sync(&self, entity: EntityType) -> Option<ChangeSet> {
        if self.closed.is_cancelled() || self.states.status(entity).is_none() {
            return None;
        }

        // 先订阅再入队，避免错过完成事件
        let mut completions = self.completions.subscribe();
        let seq = self.queue.enqueue(entity, SyncPriority::FORCE, TaskOrigin::Manual);
        self.wake();

        let mut follow_any = false;
        loop {
            let completion = tokio::select! {
                _ = self.closed.cancelled() => return None,
                received = completions.recv() => received,
            };
            match completion {
                Ok(c) if c.entity == entity && (follow_any || c.seq == Some(seq)) => match c.outcome {
                    SyncOutcome::Synced { change_set, .. } => return change_set,
                    SyncOutcome::Failed { .. } => return None,
                    // 同实体已在同步，等它的结果
                    SyncOutcome::Skipped => follow_any = true,
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("force_sync({}) 落后 {} 个完成事件", entity, n);
                    follow_any = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
