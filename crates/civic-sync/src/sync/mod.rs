/// 增量同步模块
///
/// 职责：
/// - 按实体类型定时调度、按优先级串行执行增量拉取
/// - 应用变更到实体缓存，刷新二级缓存并通知订阅者
/// - 依赖实体的一跳级联、失败退避重试
/// - 同步状态的维护与持久化

pub mod entity_type;
pub mod payload;
pub mod change;
pub mod priority;
pub mod entity_config;
pub mod state;
pub mod state_store;
pub mod queue;
pub mod retry;
pub mod delta;
pub mod applier;
pub mod search_index;
pub mod notifier;
pub mod scheduler;
pub mod executor;
pub mod reconcile;

pub use entity_type::EntityType;
pub use payload::{Bill, BillAction, Committee, EngagementEvent, EntityPayload, Representative};
pub use change::{ChangeKind, ChangeRecord, ChangeSet, ChangeSetMetadata, ChangeSource};
pub use priority::SyncPriority;
pub use entity_config::{default_entity_configs, SyncConfig};
pub use state::{SyncState, SyncStateRegistry, SyncStatus};
pub use state_store::SyncStateStore;
pub use queue::{QueuedTaskInfo, SyncQueue, SyncTask, TaskOrigin};
pub use retry::{RetryPolicy, SyncFailureKind};
pub use delta::DeltaFetcher;
pub use applier::{ApplySummary, ChangeApplier, ChangeHook};
pub use search_index::SearchIndex;
pub use notifier::{ChangeNotification, NotifierStats, SubscriptionHandle, SubscriptionNotifier};
pub use scheduler::SyncScheduler;
pub use executor::{ExecutorStats, SyncCompletion, SyncExecutor, SyncOutcome};
pub use reconcile::{ReconcileSweep, SweepOutcome};
