//! 上下文环境：一个上下文（标签页 / 窗口）内所有同步状态共享的存储、广播和事件

use std::sync::Arc;

use tracing::{debug, info};

use crate::broadcast::{BroadcastTransport, SledBroadcast};
use crate::config::SyncedStateConfig;
use crate::error::Result;
use crate::events::EventManager;
use crate::store::{KeyValueStore, SledStore};

/// 同步环境
///
/// 没有存储的环境即"无环境"模式（例如预渲染）：加载和监听都不执行，
/// 状态保持 loading。
#[derive(Clone)]
pub struct SyncEnvironment {
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn BroadcastTransport>>,
    events: Arc<EventManager>,
    config: SyncedStateConfig,
}

impl SyncEnvironment {
    pub fn builder() -> SyncEnvironmentBuilder {
        SyncEnvironmentBuilder::new()
    }

    /// 按配置打开 sled 存储和 sled 广播
    pub async fn open(config: SyncedStateConfig) -> Result<Self> {
        config.validate()?;
        let store = SledStore::open(&config.data_dir).await?;
        let transport = SledBroadcast::new(store.db(), config.channel_name.clone(), config.watch_poll_interval())?;
        info!("✅ 同步环境已打开: {}", config.data_dir.display());
        if config.debug_mode {
            debug!("🔧 调试模式已启用: {:?}", config);
        }

        Ok(Self::builder()
            .store(Arc::new(store))
            .transport(Arc::new(transport))
            .config(config)
            .build())
    }

    /// 无环境模式
    pub fn headless() -> Self {
        Self::builder().build()
    }

    pub fn store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.store.as_ref()
    }

    pub fn transport(&self) -> Option<&Arc<dyn BroadcastTransport>> {
        self.transport.as_ref()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn config(&self) -> &SyncedStateConfig {
        &self.config
    }

    pub fn is_headless(&self) -> bool {
        self.store.is_none()
    }
}

impl std::fmt::Debug for SyncEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEnvironment")
            .field("headless", &self.is_headless())
            .field("channel", &self.transport.as_ref().map(|t| t.channel_name().to_string()))
            .field("config", &self.config)
            .finish()
    }
}

/// 环境构建器
pub struct SyncEnvironmentBuilder {
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn BroadcastTransport>>,
    events: Option<Arc<EventManager>>,
    config: SyncedStateConfig,
}

impl SyncEnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            transport: None,
            events: None,
            config: SyncedStateConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 共享事件管理器（默认每个环境一个）
    pub fn events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: SyncedStateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SyncEnvironment {
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventManager::new(self.config.event_buffer_size)));
        SyncEnvironment {
            store: self.store,
            transport: self.transport,
            events,
            config: self.config,
        }
    }
}

impl Default for SyncEnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn test_headless_environment() {
        let env = SyncEnvironment::headless();
        assert!(env.is_headless());
        assert!(env.transport().is_none());
    }

    #[test]
    fn test_builder_with_memory_store() {
        let hub = BroadcastHub::new("test", 8);
        let env = SyncEnvironment::builder()
            .store(Arc::new(MemoryStore::new()))
            .transport(Arc::new(hub.join()))
            .build();
        assert!(!env.is_headless());
        assert_eq!(env.transport().map(|t| t.channel_name()), Some("test"));
    }

    #[tokio::test]
    async fn test_open_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = SyncedStateConfig::builder()
            .data_dir(temp_dir.path())
            .channel_name("open-test")
            .build();

        let env = SyncEnvironment::open(config).await.unwrap();
        assert!(!env.is_headless());
        assert_eq!(env.transport().map(|t| t.channel_name()), Some("open-test"));
        assert!(temp_dir.path().join("kv").exists());
    }
}
