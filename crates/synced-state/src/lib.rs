//! Synced State - 持久化、跨上下文同步的响应式状态
//!
//! 本库提供：
//! - 💾 绑定键值存储的状态容器：首次使用写入初始值，之后每次变更自动写回
//! - 📡 跨上下文同步：写入成功后广播新鲜度令牌，其他上下文收到后重新加载
//! - 🔑 可切换的键：切换时重新加载，旧键不会被新值覆盖
//! - ⚙️ 事件系统：加载、提交、存储失败统一通过事件管理器观察
//! - 🧵 并发安全：状态迁移在锁内同步完成，存储 IO 在 tokio 任务中执行
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use synced_state::{SyncEnvironment, SyncedState, SyncedStateConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncedStateConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build();
//!     let env = SyncEnvironment::open(config).await?;
//!
//!     let counter = SyncedState::builder("counter").initial(0u32).spawn(&env);
//!     counter.wait_until_loaded().await?;
//!
//!     counter.update(|prev| prev.map(|n| n + 1));
//!     counter.flush().await?;
//!
//!     println!("counter = {:?}", counter.get());
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod key;
pub mod lifecycle;
pub mod state;
pub mod store;

pub use broadcast::{
    BroadcastHub, BroadcastSubscription, BroadcastTransport, ContextId, FreshnessToken, LocalBroadcast,
    SledBroadcast,
};
pub use config::{SyncedStateConfig, SyncedStateConfigBuilder};
pub use environment::{SyncEnvironment, SyncEnvironmentBuilder};
pub use error::{Result, SyncedStateError};
pub use events::{EventFilter, EventManager, EventStats, LoadCause, StoreOperation, SyncEvent};
pub use key::{StoreHandle, StoreKey};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use state::{SetAction, Snapshot, StateSetter, StateValue, SyncedState, SyncedStateBuilder};
pub use store::{KeyValueStore, MemoryStore, SledStore, StoreStats};
