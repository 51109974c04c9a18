//! 同步状态配置

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broadcast::DEFAULT_CHANNEL_NAME;
use crate::error::{Result, SyncedStateError};
use crate::key::StoreHandle;

/// 同步状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedStateConfig {
    /// 数据存储目录（sled 数据库位于 `data_dir/kv`）
    pub data_dir: PathBuf,
    /// 跨上下文广播通道名
    pub channel_name: String,
    /// 未指定存储句柄时使用的默认句柄
    pub default_store: StoreHandle,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 进程内广播缓冲区大小
    pub broadcast_capacity: usize,
    /// sled 广播订阅线程的轮询间隔（毫秒）
    pub watch_poll_interval_ms: u64,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for SyncedStateConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            default_store: StoreHandle::default(),
            event_buffer_size: 1000,
            broadcast_capacity: 256,
            watch_poll_interval_ms: 100,
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.synced-state/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".synced-state")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".synced-state")
    } else {
        PathBuf::from("./synced_state_data")
    }
}

impl SyncedStateConfig {
    pub fn builder() -> SyncedStateConfigBuilder {
        SyncedStateConfigBuilder::new()
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.channel_name.trim().is_empty() {
            return Err(SyncedStateError::Config("channel_name 不能为空".to_string()));
        }
        if self.event_buffer_size == 0 || self.broadcast_capacity == 0 {
            return Err(SyncedStateError::Config("缓冲区大小必须大于 0".to_string()));
        }
        if self.watch_poll_interval_ms == 0 {
            return Err(SyncedStateError::Config("watch_poll_interval_ms 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
pub struct SyncedStateConfigBuilder {
    config: SyncedStateConfig,
}

impl SyncedStateConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncedStateConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn channel_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.channel_name = name.into();
        self
    }

    pub fn default_store(mut self, store: StoreHandle) -> Self {
        self.config.default_store = store;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity;
        self
    }

    pub fn watch_poll_interval_ms(mut self, interval: u64) -> Self {
        self.config.watch_poll_interval_ms = interval;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SyncedStateConfig {
        self.config
    }
}

impl Default for SyncedStateConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = SyncedStateConfig::builder()
            .data_dir("/tmp/synced")
            .channel_name("prefs-sync")
            .default_store(StoreHandle::new("app", "prefs"))
            .watch_poll_interval_ms(25)
            .debug_mode(true)
            .build();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/synced"));
        assert_eq!(config.channel_name, "prefs-sync");
        assert_eq!(config.default_store.store_name, "prefs");
        assert_eq!(config.watch_poll_interval(), Duration::from_millis(25));
        assert!(config.debug_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = SyncedStateConfig::default();
        assert_eq!(config.channel_name, DEFAULT_CHANNEL_NAME);
        assert_eq!(config.default_store, StoreHandle::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_channel() {
        let config = SyncedStateConfig::builder().channel_name("  ").build();
        assert!(matches!(config.validate(), Err(SyncedStateError::Config(_))));
    }

    #[test]
    fn test_config_serde() {
        let config = SyncedStateConfig::builder().channel_name("x").build();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncedStateConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.channel_name, "x");
    }
}
