//! 实体同步状态
//!
//! 每个实体类型一份 SyncState，`syncing` 状态的进入与退出只能经由
//! [`SyncStateRegistry`]，保证同一实体类型同一时刻至多一个同步在进行。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::EntityType;

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Paused,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Error => write!(f, "error"),
            SyncStatus::Paused => write!(f, "paused"),
        }
    }
}

/// 单个实体类型的同步状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// 高水位：已成功应用的最大增量字段值
    pub last_sync_time: Option<DateTime<Utc>>,
    /// 最近一次成功完成同步的墙上时间
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub error_count: u32,
    pub synced_records: u64,
    /// 有界环形缓冲，最旧的先被挤出
    pub error_messages: VecDeque<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_sync_time: None,
            last_run_at: None,
            status: SyncStatus::Idle,
            error_count: 0,
            synced_records: 0,
            error_messages: VecDeque::new(),
        }
    }
}

impl SyncState {
    fn push_error(&mut self, message: String, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.error_messages.len() >= limit {
            self.error_messages.pop_front();
        }
        self.error_messages.push_back(message);
    }
}

/// 失败处理结果，交给重试策略决定是否再次入队
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub error_count: u32,
    /// 同步进行中收到了 pause，收尾后停在 paused
    pub paused: bool,
}

#[derive(Default)]
struct Inner {
    states: HashMap<EntityType, SyncState>,
    /// syncing 期间收到的 pause，收尾时生效
    pause_requested: HashSet<EntityType>,
    /// 对账占用槽位前的状态
    exclusive: HashMap<EntityType, SyncStatus>,
}

/// SyncState 注册表
pub struct SyncStateRegistry {
    inner: Mutex<Inner>,
    error_history_limit: usize,
}

impl SyncStateRegistry {
    pub fn new(entities: impl IntoIterator<Item = EntityType>, error_history_limit: usize) -> Self {
        let states = entities
            .into_iter()
            .map(|entity| (entity, SyncState::default()))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                states,
                ..Inner::default()
            }),
            error_history_limit,
        }
    }

    /// 从持久化状态恢复；任何残留的 syncing / error / paused 一律重置为 idle
    pub fn restore(&self, persisted: HashMap<EntityType, SyncState>) {
        let mut inner = self.inner.lock();
        let states = &mut inner.states;
        for (entity, mut state) in persisted {
            if !states.contains_key(&entity) {
                continue;
            }
            state.status = SyncStatus::Idle;
            while state.error_messages.len() > self.error_history_limit {
                state.error_messages.pop_front();
            }
            states.insert(entity, state);
        }
    }

    pub fn get(&self, entity: EntityType) -> Option<SyncState> {
        self.inner.lock().states.get(&entity).cloned()
    }

    pub fn status(&self, entity: EntityType) -> Option<SyncStatus> {
        self.inner.lock().states.get(&entity).map(|s| s.status)
    }

    pub fn snapshot(&self) -> HashMap<EntityType, SyncState> {
        self.inner.lock().states.clone()
    }

    /// 尝试进入 syncing；已在 syncing 或实体未配置时返回 None
    ///
    /// 成功时清空 error_messages 并返回当前水位。
    /// 暂停中的实体也可以进入（force-sync），收尾后回到 paused。
    pub fn try_begin(&self, entity: EntityType) -> Option<Option<DateTime<Utc>>> {
        let mut inner = self.inner.lock();
        let state = inner.states.get_mut(&entity)?;
        if state.status == SyncStatus::Syncing {
            return None;
        }
        let was_paused = state.status == SyncStatus::Paused;
        state.status = SyncStatus::Syncing;
        state.error_messages.clear();
        let high_water_mark = state.last_sync_time;
        if was_paused {
            inner.pause_requested.insert(entity);
        }
        Some(high_water_mark)
    }

    /// 占用 syncing 槽位做非增量工作（对账），不改动水位与错误信息
    pub fn begin_exclusive(&self, entity: EntityType) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.states.get_mut(&entity) else {
            return false;
        };
        let previous = state.status;
        if previous == SyncStatus::Syncing || previous == SyncStatus::Paused {
            return false;
        }
        state.status = SyncStatus::Syncing;
        inner.exclusive.insert(entity, previous);
        true
    }

    /// 释放 [`begin_exclusive`](Self::begin_exclusive) 占用的槽位，恢复之前的状态
    pub fn end_exclusive(&self, entity: EntityType) {
        let mut inner = self.inner.lock();
        let paused = inner.pause_requested.remove(&entity);
        let previous = inner.exclusive.remove(&entity).unwrap_or(SyncStatus::Idle);
        if let Some(state) = inner.states.get_mut(&entity) {
            state.status = if paused { SyncStatus::Paused } else { previous };
        }
    }

    /// 同步成功收尾
    ///
    /// `high_water_mark` 为本次应用的最大增量字段值，只前进不后退。
    pub fn finish_success(
        &self,
        entity: EntityType,
        applied: usize,
        high_water_mark: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.inner.lock();
        let paused = inner.pause_requested.remove(&entity);
        if let Some(state) = inner.states.get_mut(&entity) {
            if applied > 0 {
                state.last_sync_time = match (state.last_sync_time, high_water_mark) {
                    (Some(current), Some(new)) => Some(current.max(new)),
                    (None, Some(new)) => Some(new),
                    (current, None) => current,
                };
                state.error_count = 0;
                state.synced_records += applied as u64;
            }
            state.last_run_at = Some(Utc::now());
            state.status = if paused { SyncStatus::Paused } else { SyncStatus::Idle };
        }
    }

    /// 同步失败收尾：status → error，error_count += 1
    pub fn finish_error(&self, entity: EntityType, message: String) -> Option<FailureOutcome> {
        let mut inner = self.inner.lock();
        let paused = inner.pause_requested.remove(&entity);
        let state = inner.states.get_mut(&entity)?;
        state.status = if paused { SyncStatus::Paused } else { SyncStatus::Error };
        state.error_count += 1;
        state.push_error(message, self.error_history_limit);
        Some(FailureOutcome {
            error_count: state.error_count,
            paused,
        })
    }

    /// 暂停；正在进行的同步继续跑完，收尾时停在 paused
    pub fn pause(&self, entity: EntityType) -> bool {
        let mut inner = self.inner.lock();
        let syncing = match inner.states.get_mut(&entity) {
            Some(state) if state.status == SyncStatus::Syncing => true,
            Some(state) => {
                state.status = SyncStatus::Paused;
                false
            }
            None => return false,
        };
        if syncing {
            inner.pause_requested.insert(entity);
        }
        true
    }

    /// 恢复为 idle 并清零错误计数
    pub fn resume(&self, entity: EntityType) -> bool {
        let mut inner = self.inner.lock();
        inner.pause_requested.remove(&entity);
        match inner.states.get_mut(&entity) {
            Some(state) => {
                if state.status != SyncStatus::Syncing {
                    state.status = SyncStatus::Idle;
                }
                state.error_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn is_paused(&self, entity: EntityType) -> bool {
        self.status(entity) == Some(SyncStatus::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registry() -> SyncStateRegistry {
        SyncStateRegistry::new(EntityType::all(), 3)
    }

    #[test]
    fn begin_is_mutually_exclusive() {
        let registry = registry();
        assert_eq!(registry.try_begin(EntityType::Bills), Some(None));
        assert_eq!(registry.try_begin(EntityType::Bills), None);
        // 其他实体类型不受影响
        assert!(registry.try_begin(EntityType::Committees).is_some());
    }

    #[test]
    fn success_advances_high_water_mark_monotonically() {
        let registry = registry();
        let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        registry.try_begin(EntityType::Bills);
        registry.finish_success(EntityType::Bills, 2, Some(t1));
        registry.try_begin(EntityType::Bills);
        registry.finish_success(EntityType::Bills, 1, Some(t0));

        let state = registry.get(EntityType::Bills).unwrap();
        assert_eq!(state.last_sync_time, Some(t1));
        assert_eq!(state.synced_records, 3);
        assert_eq!(state.status, SyncStatus::Idle);
    }

    #[test]
    fn error_ring_is_bounded() {
        let registry = registry();
        for i in 0..5 {
            registry.try_begin(EntityType::Committees);
            let outcome = registry
                .finish_error(EntityType::Committees, format!("boom {}", i))
                .unwrap();
            assert_eq!(outcome.error_count, i + 1);
        }
        let state = registry.get(EntityType::Committees).unwrap();
        assert_eq!(state.status, SyncStatus::Error);
        // try_begin 每次都会清空，只剩最后一条
        assert_eq!(state.error_messages.len(), 1);
        assert_eq!(state.error_messages.back().map(String::as_str), Some("boom 4"));
    }

    #[test]
    fn restore_forces_idle() {
        let registry = registry();
        let mut persisted = HashMap::new();
        persisted.insert(
            EntityType::Bills,
            SyncState {
                status: SyncStatus::Syncing,
                error_count: 2,
                ..SyncState::default()
            },
        );
        registry.restore(persisted);
        let state = registry.get(EntityType::Bills).unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.error_count, 2);
    }

    #[test]
    fn pause_during_sync_takes_effect_on_finish() {
        let registry = registry();
        registry.try_begin(EntityType::Bills);
        assert!(registry.pause(EntityType::Bills));
        assert_eq!(registry.status(EntityType::Bills), Some(SyncStatus::Syncing));
        registry.finish_success(EntityType::Bills, 0, None);
        assert_eq!(registry.status(EntityType::Bills), Some(SyncStatus::Paused));

        registry.resume(EntityType::Bills);
        registry.try_begin(EntityType::Bills);
        registry.pause(EntityType::Bills);
        let outcome = registry.finish_error(EntityType::Bills, "down".into()).unwrap();
        assert!(outcome.paused);
        assert_eq!(registry.status(EntityType::Bills), Some(SyncStatus::Paused));
    }

    #[test]
    fn force_sync_while_paused_returns_to_paused() {
        let registry = registry();
        registry.pause(EntityType::Committees);
        assert!(registry.try_begin(EntityType::Committees).is_some());
        registry.finish_success(EntityType::Committees, 1, None);
        assert_eq!(registry.status(EntityType::Committees), Some(SyncStatus::Paused));
    }

    #[test]
    fn exclusive_slot_restores_previous_status() {
        let registry = registry();
        registry.try_begin(EntityType::Bills);
        registry.finish_error(EntityType::Bills, "timeout".into());

        assert!(registry.begin_exclusive(EntityType::Bills));
        assert_eq!(registry.try_begin(EntityType::Bills), None);
        registry.end_exclusive(EntityType::Bills);

        let state = registry.get(EntityType::Bills).unwrap();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.error_count, 1);
        assert_eq!(state.error_messages.len(), 1);
    }

    #[test]
    fn pause_and_resume() {
        let registry = registry();
        assert!(registry.pause(EntityType::Committees));
        assert!(registry.is_paused(EntityType::Committees));
        assert!(registry.resume(EntityType::Committees));
        assert_eq!(registry.status(EntityType::Committees), Some(SyncStatus::Idle));
    }
}
