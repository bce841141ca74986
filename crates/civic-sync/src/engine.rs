//! 同步引擎
//!
//! 构造一次、按引用传递的门面：组装缓存、数据源、调度器、执行器、实时通道与
//! 订阅通知，并负责后台任务的启动与有序关停。
//!
//! 关停顺序：
//! 1. 取消根 token（定时器、排空节拍、待触发重试、持久化与对账循环）
//! 2. 在 `shutdown_timeout` 内排空队列，超时丢弃剩余任务
//! 3. 关闭执行器，等待中的 force_sync 返回；截止时间后仍未退出的后台任务被中止
//! 4. 关闭实时通道
//! 5. 持久化同步状态

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{EntityCache, EntityCacheConfig, KvEntityCache};
use crate::config::SyncEngineConfig;
use crate::error::{CivicSyncError, Result};
use crate::logging::init_logging;
use crate::provider::{DataProvider, HttpDataProvider, ProviderRegistry};
use crate::realtime::{BridgeState, BridgeStats, RealtimeBridge, RealtimeTransport, WebSocketTransport};
use crate::storage::KvStore;
use crate::sync::{
    ApplySummary, ChangeApplier, ChangeHook, ChangeNotification, ChangeSet, DeltaFetcher, EntityPayload,
    EntityType, ExecutorStats, NotifierStats, QueuedTaskInfo, ReconcileSweep, SearchIndex, SubscriptionHandle,
    SubscriptionNotifier, SweepOutcome, SyncConfig, SyncExecutor, SyncQueue, SyncScheduler, SyncState,
    SyncStateRegistry, SyncStateStore,
};
use crate::version::version_summary;

/// 排空用完关停时限后，实时通道仍可用于收尾的时间
const BRIDGE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// 同步引擎构建器
pub struct SyncEngineBuilder {
    config: SyncEngineConfig,
    providers: ProviderRegistry,
    cache: Option<Arc<dyn EntityCache>>,
    kv: Option<Arc<KvStore>>,
    transport: Option<Arc<dyn RealtimeTransport>>,
    hooks: Vec<Arc<dyn ChangeHook>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncEngineConfig) -> Self {
        Self {
            config,
            providers: ProviderRegistry::new(),
            cache: None,
            kv: None,
            transport: None,
            hooks: Vec::new(),
        }
    }

    /// 全部实体共用的数据源；不设置时按 `config.http` 创建 HTTP 数据源
    pub fn provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.set_default(provider);
        self
    }

    /// 为单个实体指定数据源
    pub fn entity_provider(mut self, entity: EntityType, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.register(entity, provider);
        self
    }

    /// 自定义实体缓存；不设置时使用数据目录下的 sled 缓存
    pub fn cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 自定义 KV 存储（同步状态与默认缓存）；不设置时打开 `data_dir`
    pub fn kv_store(mut self, kv: Arc<KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// 自定义实时传输；不设置时按 `realtime_url` 创建 WebSocket 传输
    pub fn realtime_transport(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn ChangeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub async fn build(self) -> Result<SyncEngine> {
        let Self {
            config,
            mut providers,
            cache,
            kv,
            transport,
            hooks,
        } = self;
        config.validate()?;
        if config.debug_mode {
            init_logging(true);
        }
        info!("初始化同步引擎: {}", version_summary());

        if !providers.has_default() {
            if let Some(http) = &config.http {
                providers.set_default(Arc::new(HttpDataProvider::new(http.clone())?));
            }
        }
        if providers.is_empty() {
            return Err(CivicSyncError::Config("未配置任何数据源".to_string()));
        }

        let kv = match kv {
            Some(kv) => kv,
            None => Arc::new(KvStore::open(&config.data_dir).await?),
        };
        let cache: Arc<dyn EntityCache> = match cache {
            Some(cache) => cache,
            None => Arc::new(KvEntityCache::new(
                kv.clone(),
                EntityCacheConfig {
                    ttl_secs: config.cache_ttl_secs,
                },
            )),
        };

        let configs: HashMap<EntityType, SyncConfig> = config
            .entities
            .iter()
            .cloned()
            .map(|c| (c.entity_type, c))
            .collect();
        let configs = Arc::new(configs);

        let states = Arc::new(SyncStateRegistry::new(
            configs.keys().copied(),
            config.error_history_limit,
        ));
        let state_store = Arc::new(SyncStateStore::new(kv));
        let persisted = state_store.load_all().await?;
        info!("恢复 {} 个实体的同步状态", persisted.len());
        states.restore(persisted);

        let queue = Arc::new(SyncQueue::new());
        let notifier = Arc::new(SubscriptionNotifier::new(config.event_buffer_size));
        let fetcher = Arc::new(DeltaFetcher::new(configs.clone(), providers, cache.clone()));
        let applier = Arc::new(ChangeApplier::new(
            cache.clone(),
            notifier.clone(),
            configs.clone(),
            queue.clone(),
            states.clone(),
        ));

        let search_index = Arc::new(SearchIndex::new());
        for entity in configs.keys() {
            let indexed = search_index.rebuild(*entity, cache.as_ref()).await?;
            if indexed > 0 {
                debug!("{} 搜索索引预热 {} 条", entity, indexed);
            }
        }
        applier.add_hook(search_index.clone());
        for hook in hooks {
            applier.add_hook(hook);
        }

        let shutdown = CancellationToken::new();
        let executor = Arc::new(SyncExecutor::new(
            queue.clone(),
            states.clone(),
            fetcher.clone(),
            applier.clone(),
            config.retry.clone(),
            config.inter_task_delay,
            config.event_buffer_size,
            shutdown.clone(),
        ));
        let scheduler = SyncScheduler::new(configs.clone(), queue.clone(), states.clone(), shutdown.clone());

        let transport: Option<Arc<dyn RealtimeTransport>> = match (transport, &config.realtime_url) {
            (Some(transport), _) => Some(transport),
            (None, Some(url)) => Some(Arc::new(WebSocketTransport::new(url.clone())?)),
            (None, None) => None,
        };
        let bridge = transport.map(|transport| {
            Arc::new(RealtimeBridge::new(
                transport,
                applier.clone(),
                configs.clone(),
                config.realtime_reconnect_delay,
            ))
        });

        let reconcile = Arc::new(ReconcileSweep::new(
            configs.clone(),
            fetcher.clone(),
            cache.clone(),
            applier.clone(),
            states.clone(),
        ));

        info!("同步引擎初始化完成: {} 个实体类型", configs.len());
        Ok(SyncEngine {
            config,
            configs,
            cache,
            queue,
            states,
            state_store,
            notifier,
            fetcher,
            applier,
            search_index,
            executor,
            scheduler,
            bridge,
            reconcile,
            shutdown,
            bridge_shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            bridge_task: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

pub struct SyncEngine {
    config: SyncEngineConfig,
    configs: Arc<HashMap<EntityType, SyncConfig>>,
    cache: Arc<dyn EntityCache>,
    queue: Arc<SyncQueue>,
    states: Arc<SyncStateRegistry>,
    state_store: Arc<SyncStateStore>,
    notifier: Arc<SubscriptionNotifier>,
    fetcher: Arc<DeltaFetcher>,
    applier: Arc<ChangeApplier>,
    search_index: Arc<SearchIndex>,
    executor: Arc<SyncExecutor>,
    scheduler: SyncScheduler,
    bridge: Option<Arc<RealtimeBridge>>,
    reconcile: Arc<ReconcileSweep>,
    shutdown: CancellationToken,
    /// 实时通道在队列排空之后才关闭，单独持有
    bridge_shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bridge_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SyncEngine {
    pub fn builder(config: SyncEngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// 启动后台循环（排空、持久化、实时通道、对账），只执行一次
    fn ensure_started(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CivicSyncError::ShuttingDown("同步引擎已关闭".to_string()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.executor.clone().run(self.config.drain_interval)));
        tasks.push(tokio::spawn(persist_loop(
            self.state_store.clone(),
            self.states.clone(),
            self.cache.clone(),
            self.config.persist_interval,
            self.shutdown.clone(),
        )));
        if let Some(interval) = self.config.reconcile_interval {
            tasks.push(tokio::spawn(
                self.reconcile.clone().run(interval, self.shutdown.clone()),
            ));
        }
        if let Some(bridge) = &self.bridge {
            *self.bridge_task.lock() = Some(tokio::spawn(bridge.clone().run(self.bridge_shutdown.clone())));
        }
        info!("同步引擎后台任务已启动");
        Ok(())
    }

    /// 为所有未暂停的可调度实体启动定时同步，返回启动的定时器数量
    pub fn schedule_all(&self) -> Result<usize> {
        self.ensure_started()?;
        Ok(self.scheduler.schedule_all())
    }

    /// 以最高优先级同步一个实体并等待结果
    ///
    /// 返回本次应用的变更集；失败、没有新数据或引擎已关闭时返回 None。
    pub async fn force_sync(&self, entity: EntityType) -> Option<ChangeSet> {
        if let Err(e) = self.ensure_started() {
            warn!("force_sync({}) 被拒绝: {}", entity, e);
            return None;
        }
        self.executor.force_sync(entity).await
    }

    /// 用父级参数同步带路径参数的实体（例如某个法案下的动作）
    ///
    /// 不推进水位；实体正忙或已暂停时返回 None。
    pub async fn sync_scoped(
        &self,
        entity: EntityType,
        params: &HashMap<String, String>,
    ) -> Result<Option<ChangeSet>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CivicSyncError::ShuttingDown("同步引擎已关闭".to_string()));
        }
        if !self.states.begin_exclusive(entity) {
            debug!("{} 正忙，跳过 scoped 同步", entity);
            return Ok(None);
        }
        let result = self.sync_scoped_locked(entity, params).await;
        self.states.end_exclusive(entity);
        result
    }

    async fn sync_scoped_locked(
        &self,
        entity: EntityType,
        params: &HashMap<String, String>,
    ) -> Result<Option<ChangeSet>> {
        let Some(change_set) = self.fetcher.fetch_scoped(entity, params, None).await? else {
            return Ok(None);
        };
        let summary: ApplySummary = self.applier.apply(&change_set).await?;
        info!(
            "{} scoped 同步完成: params={:?}, applied={}",
            entity,
            params,
            summary.applied()
        );
        Ok(Some(change_set))
    }

    /// 暂停实体：后续定时触发取消，已入队任务照常执行
    pub fn pause(&self, entity: EntityType) -> bool {
        let paused = self.states.pause(entity);
        self.scheduler.disarm(entity);
        if paused {
            info!("已暂停 {} 的同步", entity);
        }
        paused
    }

    pub fn resume(&self, entity: EntityType) -> bool {
        let resumed = self.states.resume(entity);
        if resumed {
            if self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire) {
                self.scheduler.arm(entity);
            }
            info!("已恢复 {} 的同步", entity);
        }
        resumed
    }

    /// 订阅实体变更，返回的句柄用于取消订阅
    pub fn subscribe<F>(&self, entity: EntityType, entity_id: Option<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        self.notifier.subscribe(entity, entity_id, callback)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifier.subscribe_stream()
    }

    pub fn get_sync_status(&self) -> HashMap<EntityType, SyncState> {
        self.states.snapshot()
    }

    pub fn sync_status(&self, entity: EntityType) -> Option<SyncState> {
        self.states.get(entity)
    }

    pub async fn get(&self, entity: EntityType, id: &str) -> Result<Option<EntityPayload>> {
        self.cache.get(entity, id).await
    }

    /// 按关键词检索缓存中的实体（全部词命中）
    pub async fn search(&self, entity: EntityType, query: &str) -> Result<Vec<EntityPayload>> {
        let mut results = Vec::new();
        for id in self.search_index.search(entity, query) {
            if let Some(payload) = self.cache.get(entity, &id).await? {
                results.push(payload);
            }
        }
        Ok(results)
    }

    /// 手动执行一次对账清扫
    pub async fn reconcile(&self, entity: EntityType) -> Result<SweepOutcome> {
        if !self.configs.contains_key(&entity) {
            return Err(CivicSyncError::UnknownEntityType(entity.to_string()));
        }
        self.reconcile.sweep(entity).await
    }

    pub fn queue_snapshot(&self) -> Vec<QueuedTaskInfo> {
        self.queue.snapshot()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier.stats()
    }

    pub fn bridge_state(&self) -> Option<BridgeState> {
        self.bridge.as_ref().map(|b| b.state())
    }

    pub fn bridge_stats(&self) -> Option<BridgeStats> {
        self.bridge.as_ref().map(|b| b.stats())
    }

    pub fn realtime_bridge(&self) -> Option<Arc<RealtimeBridge>> {
        self.bridge.clone()
    }

    pub async fn persist_states(&self) -> Result<()> {
        self.state_store.save_all(&self.states.snapshot()).await
    }

    /// 有序关停，重复调用无副作用
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("同步引擎关停中");

        self.shutdown.cancel();
        self.scheduler.disarm_all();

        let timeout = self.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        if tokio::time::timeout_at(deadline, self.executor.drain_until_empty())
            .await
            .is_err()
        {
            let dropped = self.queue.clear();
            warn!("排空队列超时 ({:?})，丢弃 {} 个任务", timeout, dropped);
        }
        self.executor.close();

        // 卡住的同步不能拖过关停时限
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            join_until(task, deadline, "后台任务").await;
        }

        self.bridge_shutdown.cancel();
        let bridge_task = self.bridge_task.lock().take();
        if let Some(task) = bridge_task {
            let bridge_deadline = deadline.max(Instant::now() + BRIDGE_CLOSE_GRACE);
            join_until(task, bridge_deadline, "实时通道任务").await;
        }

        self.persist_states().await?;
        info!("同步引擎已关闭");
        Ok(())
    }
}

/// 在截止时间前等待后台任务结束，超时则中止
async fn join_until(mut task: JoinHandle<()>, deadline: Instant, name: &str) {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{}异常退出: {}", name, e),
        Err(_) => {
            task.abort();
            warn!("{}未在关停时限内结束，已中止", name);
        }
    }
}

/// 周期持久化同步状态并清理过期缓存
async fn persist_loop(
    store: Arc<SyncStateStore>,
    states: Arc<SyncStateRegistry>,
    cache: Arc<dyn EntityCache>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = store.save_all(&states.snapshot()).await {
            error!("持久化同步状态失败: {}", e);
        }
        match cache.cleanup_expired().await {
            Ok(0) => {}
            Ok(n) => debug!("清理 {} 条过期缓存", n),
            Err(e) => warn!("清理过期缓存失败: {}", e),
        }
    }
    debug!("持久化循环已停止");
}
