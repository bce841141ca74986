mod common;

use chrono::{TimeZone, Utc};
use civic_sync::sync::{SweepOutcome, SyncStateStore, TaskOrigin};
use civic_sync::{ChangeKind, EntityType, KvStore, SyncEngine, SyncPriority, SyncStatus};
use common::{build_engine, test_config, wait_until, MockProvider};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn bills_create_advances_watermark_and_cascades() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "bills",
        vec![json!({"id": "b1", "title": "Clean Water Act", "updated_at": "2024-03-01T10:00:00Z"})],
    );
    let config = SyncEngine::builder(
        civic_sync::SyncEngineConfig::builder()
            .data_dir(dir.path())
            .inter_task_delay(Duration::from_millis(500))
            .build(),
    );
    let engine = config.provider(provider.clone()).build().await.unwrap();

    let change_set = engine.force_sync(EntityType::Bills).await.unwrap();
    assert_eq!(change_set.len(), 1);
    assert_eq!(change_set.records()[0].kind, ChangeKind::Create);

    // 级联任务在任务间隔内仍在队列中
    let queued = engine.queue_snapshot();
    assert!(queued
        .iter()
        .any(|t| t.entity == EntityType::BillActions && t.origin == TaskOrigin::Cascade));

    assert!(engine.get(EntityType::Bills, "b1").await.unwrap().is_some());
    let state = engine.sync_status(EntityType::Bills).unwrap();
    assert_eq!(
        state.last_sync_time,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
    );
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(engine.search(EntityType::Bills, "water").await.unwrap().len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_sync_filters_by_high_water_mark() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![
            json!({"id": "c2", "name": "Rules", "updated_at": "2024-01-02T00:00:00Z"}),
            json!({"id": "c1", "name": "Finance", "updated_at": "2024-01-01T00:00:00Z"}),
        ],
    );
    let engine = build_engine(dir.path(), provider.clone()).await;

    let first = engine.force_sync(EntityType::Committees).await.unwrap();
    let ids: Vec<&str> = first.records().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);

    assert!(engine.force_sync(EntityType::Committees).await.is_none());
    let queries = provider.queries_for("committees");
    assert_eq!(queries[0].filter_value, None);
    assert_eq!(queries[1].filter_value.as_deref(), Some("2024-01-02T00:00:00Z"));
    assert_eq!(queries[1].filter_field.as_deref(), Some("updated_at"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_force_syncs_never_overlap() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_delay(Duration::from_millis(30));
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "name": "Finance", "updated_at": "2024-01-01T00:00:00Z"})],
    );
    let engine = build_engine(dir.path(), provider.clone()).await;

    let results = join_all((0..5).map(|_| engine.force_sync(EntityType::Committees))).await;
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    assert_eq!(provider.max_in_flight(), 1);

    let state = engine.sync_status(EntityType::Committees).unwrap();
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(state.synced_records, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn paused_entity_is_not_scheduled_but_can_be_forced() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows("bills", vec![json!({"id": "b1", "updated_at": "2024-03-01T10:00:00Z"})]);
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "updated_at": "2024-01-01T00:00:00Z"})],
    );
    let gate = provider.gate("bills");
    let engine = Arc::new(build_engine(dir.path(), provider.clone()).await);

    assert!(engine.pause(EntityType::Committees));
    assert_eq!(engine.schedule_all().unwrap(), 3);

    let bills = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.force_sync(EntityType::Bills).await })
    };
    wait_until(|| engine.sync_status(EntityType::Bills).map(|s| s.status) == Some(SyncStatus::Syncing)).await;

    let committees = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.force_sync(EntityType::Committees).await })
    };
    wait_until(|| {
        engine
            .queue_snapshot()
            .iter()
            .any(|t| t.entity == EntityType::Committees)
    })
    .await;
    let queued = engine.queue_snapshot();
    let task = queued
        .iter()
        .find(|t| t.entity == EntityType::Committees)
        .unwrap();
    assert_eq!(task.priority, SyncPriority::FORCE);
    assert_eq!(task.origin, TaskOrigin::Manual);
    assert_eq!(queued.iter().filter(|t| t.entity == EntityType::Committees).count(), 1);

    gate.add_permits(1);
    assert!(bills.await.unwrap().is_some());
    assert!(committees.await.unwrap().is_some());
    assert_eq!(
        engine.sync_status(EntityType::Committees).map(|s| s.status),
        Some(SyncStatus::Paused)
    );

    assert!(engine.resume(EntityType::Committees));
    assert_eq!(
        engine.sync_status(EntityType::Committees).map(|s| s.status),
        Some(SyncStatus::Idle)
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_sync_records_error_and_schedules_retry() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.fail("engagement/events");
    let engine = build_engine(dir.path(), provider).await;

    assert!(engine.force_sync(EntityType::EngagementEvents).await.is_none());
    let state = engine.sync_status(EntityType::EngagementEvents).unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.error_count, 1);
    assert_eq!(state.error_messages.len(), 1);
    assert_eq!(engine.executor_stats().retries_scheduled, 1);

    // 其他实体不受影响
    assert_eq!(
        engine.sync_status(EntityType::Committees).map(|s| s.status),
        Some(SyncStatus::Idle)
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_and_cache_survive_restart() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "name": "Finance", "updated_at": "2024-05-01T08:30:00Z"})],
    );

    let engine = build_engine(dir.path(), provider).await;
    assert!(engine.force_sync(EntityType::Committees).await.is_some());
    engine.shutdown().await.unwrap();
    drop(engine);

    let provider = MockProvider::new();
    let engine = build_engine(dir.path(), provider.clone()).await;
    let state = engine.sync_status(EntityType::Committees).unwrap();
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(
        state.last_sync_time,
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap())
    );
    assert!(engine.get(EntityType::Committees, "c1").await.unwrap().is_some());
    assert_eq!(engine.search(EntityType::Committees, "finance").await.unwrap().len(), 1);

    assert!(engine.force_sync(EntityType::Committees).await.is_none());
    let queries = provider.queries_for("committees");
    assert_eq!(queries[0].filter_value.as_deref(), Some("2024-05-01T08:30:00Z"));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent_and_rejects_new_work() {
    let dir = TempDir::new().unwrap();
    let engine = build_engine(dir.path(), MockProvider::new()).await;
    engine.schedule_all().unwrap();
    assert!(engine.is_running());

    engine.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
    assert!(!engine.is_running());
    assert!(engine.schedule_all().is_err());
    assert!(engine.force_sync(EntityType::Bills).await.is_none());
    assert!(engine.queue_snapshot().is_empty());
}

#[tokio::test]
async fn scoped_sync_resolves_parent_params() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "bills/b1/actions",
        vec![json!({"id": "a1", "bill_id": "b1", "action_date": "2024-03-02", "description": "Referred to committee"})],
    );
    let engine = build_engine(dir.path(), provider).await;

    let params = HashMap::from([("bill_id".to_string(), "b1".to_string())]);
    let change_set = engine
        .sync_scoped(EntityType::BillActions, &params)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change_set.len(), 1);
    assert!(engine.get(EntityType::BillActions, "a1").await.unwrap().is_some());

    let state = engine.sync_status(EntityType::BillActions).unwrap();
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(state.last_sync_time, None);

    assert!(engine
        .sync_scoped(EntityType::BillActions, &HashMap::new())
        .await
        .is_err());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscribers_receive_filtered_changes() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "representatives",
        vec![
            json!({"id": 7, "name": "A. Rivera", "updated_at": "2024-02-01T00:00:00Z"}),
            json!({"id": 8, "name": "B. Chen", "updated_at": "2024-02-02T00:00:00Z"}),
        ],
    );
    let engine = build_engine(dir.path(), provider).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let seen = seen.clone();
        engine.subscribe(EntityType::Representatives, Some("8".to_string()), move |change| {
            seen.lock().push(change.id.clone());
        })
    };
    let _ = engine.force_sync(EntityType::Representatives).await.unwrap();
    assert_eq!(*seen.lock(), vec!["8".to_string()]);
    assert!(handle.unsubscribe());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconcile_removes_entries_gone_upstream() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![
            json!({"id": "c1", "updated_at": "2024-01-01T00:00:00Z"}),
            json!({"id": "c2", "updated_at": "2024-01-02T00:00:00Z"}),
        ],
    );
    let engine = build_engine(dir.path(), provider.clone()).await;
    engine.force_sync(EntityType::Committees).await.unwrap();

    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "updated_at": "2024-01-01T00:00:00Z"})],
    );
    let mut changes = engine.subscribe_changes();
    assert_eq!(
        engine.reconcile(EntityType::Committees).await.unwrap(),
        SweepOutcome::Swept(1)
    );
    assert!(engine.get(EntityType::Committees, "c2").await.unwrap().is_none());
    let change = changes.recv().await.unwrap();
    assert_eq!(change.id, "c2");
    assert_eq!(change.kind, ChangeKind::Delete);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconcile_aborts_when_listing_cannot_page() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1"}), json!({"id": "c2"}), json!({"id": "c3"})],
    );
    let config = civic_sync::SyncEngineConfig::builder()
        .data_dir(dir.path())
        .entity(
            civic_sync::SyncConfig::new(
                EntityType::Committees,
                "committees",
                Duration::from_secs(3600),
                SyncPriority::saturating(5),
            )
            .with_batch_size(2),
        )
        .build();
    let engine = SyncEngine::builder(config)
        .provider(provider.clone())
        .build()
        .await
        .unwrap();
    engine.force_sync(EntityType::Committees).await.unwrap();
    // 首批只取到两条，第三条手动写入缓存
    provider.set_rows("committees", vec![json!({"id": "c3"})]);
    engine.force_sync(EntityType::Committees).await.unwrap();
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1"}), json!({"id": "c2"}), json!({"id": "c3"})],
    );
    for id in ["c1", "c2", "c3"] {
        assert!(engine.get(EntityType::Committees, id).await.unwrap().is_some());
    }

    assert!(engine.reconcile(EntityType::Committees).await.is_err());
    for id in ["c1", "c2", "c3"] {
        assert!(engine.get(EntityType::Committees, id).await.unwrap().is_some());
    }
    assert_eq!(
        engine.sync_status(EntityType::Committees).map(|s| s.status),
        Some(SyncStatus::Idle)
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn fractional_watermark_does_not_refetch_same_record() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "name": "Budget", "updated_at": "2024-05-01T09:30:00.500Z"})],
    );
    let engine = build_engine(dir.path(), provider.clone()).await;

    assert!(engine.force_sync(EntityType::Committees).await.is_some());
    assert!(engine.force_sync(EntityType::Committees).await.is_none());
    let queries = provider.queries_for("committees");
    assert_eq!(
        queries[1].filter_value.as_deref(),
        Some("2024-05-01T09:30:00.500Z")
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn states_persist_on_interval_before_shutdown() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(KvStore::temporary().unwrap());
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "updated_at": "2024-02-01T00:00:00Z"})],
    );
    let engine = SyncEngine::builder(test_config(dir.path()))
        .provider(provider.clone())
        .kv_store(kv.clone())
        .build()
        .await
        .unwrap();
    let store = SyncStateStore::new(kv);
    let mark = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

    engine.force_sync(EntityType::Committees).await.unwrap();
    let saved = store.load_all().await.unwrap();
    assert_eq!(
        saved.get(&EntityType::Committees).and_then(|s| s.last_sync_time),
        None
    );

    tokio::time::sleep(engine.config().persist_interval + Duration::from_secs(1)).await;
    let saved = store.load_all().await.unwrap();
    assert_eq!(
        saved.get(&EntityType::Committees).and_then(|s| s.last_sync_time),
        Some(mark)
    );
    assert!(engine.is_running());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_queue_after_timeout() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new();
    provider.set_rows(
        "committees",
        vec![json!({"id": "c1", "updated_at": "2024-01-01T00:00:00Z"})],
    );
    provider.set_rows("bills", vec![json!({"id": "b1", "updated_at": "2024-03-01T10:00:00Z"})]);
    let _gate = provider.gate("committees");
    let engine = Arc::new(build_engine(dir.path(), provider.clone()).await);

    let committees = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.force_sync(EntityType::Committees).await })
    };
    wait_until(|| {
        engine.sync_status(EntityType::Committees).map(|s| s.status) == Some(SyncStatus::Syncing)
    })
    .await;
    let bills = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.force_sync(EntityType::Bills).await })
    };
    wait_until(|| engine.queue_snapshot().iter().any(|t| t.entity == EntityType::Bills)).await;

    // 卡住的同步不会让关停超过时限
    let started = tokio::time::Instant::now();
    engine.shutdown().await.unwrap();
    let elapsed = started.elapsed();
    let timeout = engine.config().shutdown_timeout;
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(1));

    assert!(engine.queue_snapshot().is_empty());
    assert!(committees.await.unwrap().is_none());
    assert!(bills.await.unwrap().is_none());
    assert!(provider.queries_for("bills").is_empty());
}

#[tokio::test]
async fn config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("civic-sync.json");
    let mut config = test_config(dir.path());
    // 配置文件中的时长以整秒计
    config.drain_interval = Duration::from_secs(5);
    config.reconcile_interval = Some(Duration::from_secs(3600));
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = civic_sync::SyncEngineConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded.entities, config.entities);
    assert_eq!(loaded.reconcile_interval, Some(Duration::from_secs(3600)));
    assert_eq!(loaded.data_dir, dir.path());
}
