//! 内存键值存储 - 无持久化，多个上下文共享同一个实例即可模拟共享存储

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{KeyValueStore, StoreStats};
use crate::error::Result;
use crate::key::{StoreHandle, StoreKey};

type SlotId = (StoreHandle, StoreKey);

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<SlotId, Vec<u8>>>,
    stats: RwLock<StoreStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取操作统计
    pub fn stats(&self) -> StoreStats {
        *self.stats.read()
    }

    /// 当前条目数量
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &StoreKey, store: &StoreHandle) -> Result<Option<Vec<u8>>> {
        self.stats.write().reads += 1;
        let entries = self.entries.read();
        Ok(entries.get(&(store.clone(), key.clone())).cloned())
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>, store: &StoreHandle) -> Result<()> {
        self.stats.write().writes += 1;
        self.entries.write().insert((store.clone(), key.clone()), value);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey, store: &StoreHandle) -> Result<()> {
        self.stats.write().deletes += 1;
        self.entries.write().remove(&(store.clone(), key.clone()));
        Ok(())
    }
}
