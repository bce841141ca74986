#![allow(dead_code)]

use async_trait::async_trait;
use civic_sync::sync::payload::parse_watermark;
use civic_sync::{
    CivicSyncError, DataProvider, PageQuery, PageResponse, Result, SyncEngine, SyncEngineConfig,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 内存数据源：按 endpoint 返回固定行，遵守 `filter_field > filter_value` 与排序、分页
#[derive(Default)]
pub struct MockProvider {
    rows: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    queries: Mutex<Vec<(String, PageQuery)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rows(&self, endpoint: &str, rows: Vec<Value>) {
        self.rows.lock().insert(endpoint.to_string(), rows);
    }

    pub fn fail(&self, endpoint: &str) {
        self.failing.lock().insert(endpoint.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// 该 endpoint 的拉取阻塞到 `add_permits` 为止
    pub fn gate(&self, endpoint: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(endpoint.to_string(), gate.clone());
        gate
    }

    pub fn queries_for(&self, endpoint: &str) -> Vec<PageQuery> {
        self.queries
            .lock()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, q)| q.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn select(&self, endpoint: &str, query: &PageQuery) -> Vec<Value> {
        let mark = query
            .filter_value
            .as_ref()
            .and_then(|v| parse_watermark(&Value::String(v.clone())));
        let mut rows: Vec<Value> = self
            .rows
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|row| match mark {
                Some(mark) => row
                    .get(&query.order_by)
                    .and_then(parse_watermark)
                    .is_some_and(|ts| ts > mark),
                None => true,
            })
            .collect();
        rows.sort_by_key(|row| row.get(&query.order_by).and_then(parse_watermark));
        rows.truncate(query.limit as usize);
        rows
    }
}

#[async_trait]
impl DataProvider for MockProvider {
    async fn fetch_page(&self, endpoint: &str, query: &PageQuery) -> Result<PageResponse> {
        self.queries.lock().push((endpoint.to_string(), query.clone()));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let gate = self.gates.lock().get(endpoint).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().contains(endpoint) {
            return Err(CivicSyncError::Http {
                status: 503,
                message: format!("{} unavailable", endpoint),
            });
        }
        Ok(PageResponse {
            results: self.select(endpoint, query),
        })
    }
}

pub fn test_config(data_dir: &Path) -> SyncEngineConfig {
    SyncEngineConfig::builder()
        .data_dir(data_dir)
        .drain_interval(Duration::from_millis(200))
        .inter_task_delay(Duration::from_millis(10))
        .shutdown_timeout(Duration::from_secs(5))
        .realtime_reconnect_delay(Duration::from_millis(100))
        .build()
}

pub async fn build_engine(data_dir: &Path, provider: Arc<MockProvider>) -> SyncEngine {
    SyncEngine::builder(test_config(data_dir))
        .provider(provider)
        .build()
        .await
        .unwrap()
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
