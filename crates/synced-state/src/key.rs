//! 持久化槽位的寻址：键（StoreKey）与存储句柄（StoreHandle）

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SyncedStateError};

/// 默认数据库名
pub const DEFAULT_DB_NAME: &str = "keyval-store";
/// 默认存储名
pub const DEFAULT_STORE_NAME: &str = "keyval";

/// 持久化槽位的键
///
/// 字符串键直接使用；结构化键序列化为规范 JSON 字符串，
/// 因此相等的结构化键总是落到同一个槽位。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// 从结构化键创建（例如 `("user", 42)`）
    pub fn structured<K: Serialize>(key: &K) -> Result<Self> {
        let value = serde_json::to_value(key)?;
        if value.is_null() {
            return Err(SyncedStateError::InvalidKey("structured key must not be null".to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for StoreKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&String> for StoreKey {
    fn from(key: &String) -> Self {
        Self(key.clone())
    }
}

impl AsRef<[u8]> for StoreKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// 自定义存储句柄（数据库名 + 存储名）
///
/// 同一个键在不同句柄下是不同的槽位。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreHandle {
    pub db_name: String,
    pub store_name: String,
}

impl StoreHandle {
    pub fn new<D: Into<String>, S: Into<String>>(db_name: D, store_name: S) -> Self {
        Self {
            db_name: db_name.into(),
            store_name: store_name.into(),
        }
    }

    /// 对应的 sled Tree 名称
    pub fn tree_name(&self) -> String {
        format!("{}/{}", self.db_name, self.store_name)
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::new(DEFAULT_DB_NAME, DEFAULT_STORE_NAME)
    }
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.db_name, self.store_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_key_is_canonical() {
        let a = StoreKey::structured(&("user", 42)).unwrap();
        let b = StoreKey::structured(&("user", 42)).unwrap();
        let c = StoreKey::structured(&("user", 43)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), r#"["user",42]"#);
    }

    #[test]
    fn test_null_structured_key_rejected() {
        let key: Option<u32> = None;
        assert!(matches!(
            StoreKey::structured(&key),
            Err(SyncedStateError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_default_store_handle() {
        let handle = StoreHandle::default();
        assert_eq!(handle.tree_name(), "keyval-store/keyval");
        assert_ne!(handle, StoreHandle::new("app", "prefs"));
    }
}
