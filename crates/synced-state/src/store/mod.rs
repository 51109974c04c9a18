//! 持久化存储模块
//!
//! 本模块提供：
//! - 异步键值存储接口 `KeyValueStore`（get / set / delete）
//! - 基于 sled 的持久化实现
//! - 内存实现（带操作计数，便于验证写入次数）
//! - 值编解码（JSON）

pub mod memory;
pub mod kv;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;
use crate::key::{StoreHandle, StoreKey};

pub use self::memory::MemoryStore;
pub use self::kv::SledStore;

/// 异步键值存储
///
/// 不存在的条目以 `Ok(None)` 表示，而不是错误。
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 读取键对应的值
    async fn get(&self, key: &StoreKey, store: &StoreHandle) -> Result<Option<Vec<u8>>>;

    /// 写入键值对
    async fn set(&self, key: &StoreKey, value: Vec<u8>, store: &StoreHandle) -> Result<()>;

    /// 删除键值对（键不存在时也视为成功）
    async fn delete(&self, key: &StoreKey, store: &StoreHandle) -> Result<()>;
}

/// 存储操作统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// 序列化值
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// 反序列化值
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
