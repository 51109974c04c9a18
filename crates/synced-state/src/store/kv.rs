//! KV 存储模块 - 基于 sled 的持久化键值存储
//!
//! 本模块提供：
//! - `KeyValueStore` 的持久化实现
//! - 每个 `StoreHandle` 对应一个独立的 sled Tree
//! - 供 `SledBroadcast` 复用的共享数据库实例

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::KeyValueStore;
use crate::error::{Result, SyncedStateError};
use crate::key::{StoreHandle, StoreKey};

/// sled 数据库打开重试次数（同一路径的旧实例可能刚释放锁）
const MAX_OPEN_RETRIES: u32 = 8;
const RETRY_DELAY_MS: u64 = 300;

/// 基于 sled 的存储
#[derive(Debug, Clone)]
pub struct SledStore {
    base_path: PathBuf,
    /// 主数据库实例
    db: ::sled::Db,
    /// 已打开的 Tree（按存储句柄缓存）
    trees: Arc<RwLock<HashMap<StoreHandle, ::sled::Tree>>>,
}

impl SledStore {
    /// 在 `base_path/kv` 下打开（或创建）存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncedStateError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let mut last_err: Option<::sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match ::sled::open(&kv_path) {
                Ok(db) => {
                    info!("✅ KV 存储已打开: {}", kv_path.display());
                    return Ok(Self::from_db(base_path, db));
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        debug!("sled 数据库被占用，{}ms 后重试 (第 {} 次)", delay_ms, attempt + 1);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(SyncedStateError::StoreUnavailable(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 临时数据库（不落盘），用于测试与无持久化场景
    pub fn temporary() -> Result<Self> {
        let db = ::sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| SyncedStateError::StoreUnavailable(format!("打开临时数据库失败: {}", e)))?;
        Ok(Self::from_db(PathBuf::new(), db))
    }

    fn from_db(base_path: PathBuf, db: ::sled::Db) -> Self {
        Self {
            base_path,
            db,
            trees: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 底层数据库（广播实现复用同一个实例）
    pub fn db(&self) -> &::sled::Db {
        &self.db
    }

    /// 将缓冲数据刷到磁盘
    pub async fn flush(&self) -> Result<usize> {
        self.db
            .flush_async()
            .await
            .map_err(|e| SyncedStateError::StoreUnavailable(format!("刷盘失败: {}", e)))
    }

    /// 获取句柄对应的 Tree，不存在时打开
    fn tree(&self, store: &StoreHandle) -> Result<::sled::Tree> {
        if let Some(tree) = self.trees.read().get(store) {
            return Ok(tree.clone());
        }

        let tree = self
            .db
            .open_tree(store.tree_name())
            .map_err(|e| SyncedStateError::StoreUnavailable(format!("打开 Tree 失败: {}", e)))?;
        self.trees.write().insert(store.clone(), tree.clone());
        debug!("KV Tree 已打开: {}", store);
        Ok(tree)
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &StoreKey, store: &StoreHandle) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(store)?;
        let result = tree
            .get(key)
            .map_err(|e| SyncedStateError::StoreUnavailable(format!("获取键值对失败: {}", e)))?;
        Ok(result.map(|v| v.to_vec()))
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>, store: &StoreHandle) -> Result<()> {
        let tree = self.tree(store)?;
        tree.insert(key, value)
            .map_err(|e| SyncedStateError::StoreUnavailable(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, key: &StoreKey, store: &StoreHandle) -> Result<()> {
        let tree = self.tree(store)?;
        tree.remove(key)
            .map_err(|e| SyncedStateError::StoreUnavailable(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{decode_value, encode_value};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sled_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::open(temp_dir.path()).await.unwrap();
        let handle = StoreHandle::default();
        let key = StoreKey::from("test_key");

        let test_data = json!({
            "name": "test",
            "value": 123
        });

        store.set(&key, encode_value(&test_data).unwrap(), &handle).await.unwrap();
        let bytes = store.get(&key, &handle).await.unwrap().unwrap();
        let retrieved: serde_json::Value = decode_value(&bytes).unwrap();
        assert_eq!(retrieved, test_data);

        store.delete(&key, &handle).await.unwrap();
        assert!(store.get(&key, &handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = StoreKey::from("counter");
        let handle = StoreHandle::new("app", "state");

        {
            let store = SledStore::open(temp_dir.path()).await.unwrap();
            store.set(&key, encode_value(&5u32).unwrap(), &handle).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = SledStore::open(temp_dir.path()).await.unwrap();
        let bytes = store.get(&key, &handle).await.unwrap().unwrap();
        assert_eq!(decode_value::<u32>(&bytes).unwrap(), 5);

        // 不同句柄是不同的槽位
        assert!(store.get(&key, &StoreHandle::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_temporary_store() {
        let store = SledStore::temporary().unwrap();
        let handle = StoreHandle::default();
        let key = StoreKey::from("draft");

        assert!(store.get(&key, &handle).await.unwrap().is_none());
        store.set(&key, b"1".to_vec(), &handle).await.unwrap();
        assert_eq!(store.get(&key, &handle).await.unwrap(), Some(b"1".to_vec()));
    }
}
