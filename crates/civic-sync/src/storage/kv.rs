//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 按命名空间（sled Tree）隔离的键值存储
//! - 带过期时间的值与过期清理
//! - 前缀扫描与键枚举

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{CivicSyncError, Result};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: Option<PathBuf>,
    db: Arc<Db>,
    /// 已打开的命名空间
    trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 在 `base_path/kv` 下打开 sled 数据库
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| CivicSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个进程可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    return Ok(Self {
                        base_path: Some(base_path.to_path_buf()),
                        db: Arc::new(db),
                        trees: Arc::new(RwLock::new(HashMap::new())),
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        Err(CivicSyncError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 临时数据库（进程退出即删除），用于测试与无持久化场景
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| CivicSyncError::KvStore(format!("打开临时 sled 数据库失败: {}", e)))?;
        Ok(Self {
            base_path: None,
            db: Arc::new(db),
            trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// 获取（必要时打开）命名空间
    async fn tree(&self, name: &str) -> Result<Tree> {
        {
            let trees = self.trees.read().await;
            if let Some(tree) = trees.get(name) {
                return Ok(tree.clone());
            }
        }
        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| CivicSyncError::KvStore(format!("打开 Tree {} 失败: {}", name, e)))?;
        let mut trees = self.trees.write().await;
        trees.insert(name.to_string(), tree.clone());
        Ok(tree)
    }

    /// 设置键值对
    pub async fn set<V>(&self, tree: &str, key: &str, value: &V) -> Result<()>
    where
        V: Serialize,
    {
        let tree = self.tree(tree).await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| CivicSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        tree.insert(key, value_bytes)
            .map_err(|e| CivicSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 获取键值对
    pub async fn get<V>(&self, tree: &str, key: &str) -> Result<Option<V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.tree(tree).await?;
        let result = tree
            .get(key)
            .map_err(|e| CivicSyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| CivicSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对，返回是否存在过
    pub async fn delete(&self, tree: &str, key: &str) -> Result<bool> {
        let tree = self.tree(tree).await?;
        let removed = tree
            .remove(key)
            .map_err(|e| CivicSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    /// 检查键是否存在
    pub async fn exists(&self, tree: &str, key: &str) -> Result<bool> {
        let tree = self.tree(tree).await?;
        tree.contains_key(key)
            .map_err(|e| CivicSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 枚举命名空间下的全部键
    pub async fn keys(&self, tree: &str) -> Result<Vec<String>> {
        let tree = self.tree(tree).await?;
        let mut keys = Vec::with_capacity(tree.len());
        for key in tree.iter().keys() {
            let key = key.map_err(|e| CivicSyncError::KvStore(format!("遍历键失败: {}", e)))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, tree: &str, prefix: &str) -> Result<Vec<(String, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.tree(tree).await?;
        let mut results = Vec::new();
        for result in tree.scan_prefix(prefix) {
            let (key, value_bytes) =
                result.map_err(|e| CivicSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| CivicSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((String::from_utf8_lossy(&key).into_owned(), value));
        }
        Ok(results)
    }

    /// 设置带过期时间的值
    pub async fn set_with_ttl<V>(&self, tree: &str, key: &str, value: &V, ttl_seconds: u64) -> Result<()>
    where
        V: Serialize,
    {
        let expired_value = ExpiredValue {
            value: serde_json::to_value(value)
                .map_err(|e| CivicSyncError::Serialization(format!("序列化值失败: {}", e)))?,
            expires_at: chrono::Utc::now().timestamp_millis() + (ttl_seconds as i64) * 1000,
        };
        self.set(tree, key, &expired_value).await
    }

    /// 获取带过期时间的值；过期的键会被顺手删除
    pub async fn get_with_ttl<V>(&self, tree: &str, key: &str) -> Result<Option<V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let expired_value: ExpiredValue = match self.get(tree, key).await? {
            Some(v) => v,
            None => return Ok(None),
        };
        if expired_value.is_expired(chrono::Utc::now().timestamp_millis()) {
            self.delete(tree, key).await?;
            return Ok(None);
        }
        let value = serde_json::from_value(expired_value.value)
            .map_err(|e| CivicSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
        Ok(Some(value))
    }

    /// 清理命名空间内过期的键值对
    pub async fn cleanup_expired(&self, tree: &str) -> Result<u64> {
        let tree = self.tree(tree).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut keys_to_remove = Vec::new();

        for result in tree.iter() {
            let (key, value_bytes) =
                result.map_err(|e| CivicSyncError::KvStore(format!("遍历键值对失败: {}", e)))?;
            if let Ok(expired_value) = serde_json::from_slice::<ExpiredValue>(&value_bytes) {
                if expired_value.is_expired(now) {
                    keys_to_remove.push(key);
                }
            }
        }

        let mut removed_count = 0u64;
        for key in keys_to_remove {
            tree.remove(&key)
                .map_err(|e| CivicSyncError::KvStore(format!("删除过期键失败: {}", e)))?;
            removed_count += 1;
        }
        Ok(removed_count)
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| CivicSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 带过期时间的值结构
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpiredValue {
    value: serde_json::Value,
    /// UTC 毫秒时间戳
    expires_at: i64,
}

impl ExpiredValue {
    fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }
}
