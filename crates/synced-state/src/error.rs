use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncedStateError {
    /// 存储操作失败（配额、存储已关闭等），不自动重试
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    /// 广播通道不可用，跨上下文同步降级为单上下文
    #[error("Broadcast unavailable: {0}")]
    BroadcastUnavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("State container destroyed")]
    Destroyed,
    #[error("Config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for SyncedStateError {
    fn from(error: serde_json::Error) -> Self {
        SyncedStateError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncedStateError {
    fn from(error: std::io::Error) -> Self {
        SyncedStateError::IO(error.to_string())
    }
}

impl From<sled::Error> for SyncedStateError {
    fn from(error: sled::Error) -> Self {
        SyncedStateError::KvStore(error.to_string())
    }
}

impl SyncedStateError {
    /// 是否为存储层错误（读、写、删除失败）
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            SyncedStateError::StoreUnavailable(_) | SyncedStateError::KvStore(_) | SyncedStateError::IO(_)
        )
    }

    /// 是否为广播层错误
    pub fn is_broadcast_error(&self) -> bool {
        matches!(self, SyncedStateError::BroadcastUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncedStateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SyncedStateError::StoreUnavailable("closed".into()).is_store_error());
        assert!(SyncedStateError::KvStore("io".into()).is_store_error());
        assert!(!SyncedStateError::Destroyed.is_store_error());
        assert!(SyncedStateError::BroadcastUnavailable("sandbox".into()).is_broadcast_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let converted: SyncedStateError = err.into();
        assert!(matches!(converted, SyncedStateError::Serialization(_)));
        assert!(converted.to_string().starts_with("Serialization error"));
    }
}
