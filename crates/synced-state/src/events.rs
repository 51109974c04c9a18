//! 事件系统模块 - 同步协议的可观测事件
//!
//! 功能包括：
//! - 加载 / 提交 / 重新加载 / 存储失败事件
//! - 事件广播和订阅机制
//! - 命名监听器与事件统计
//!
//! 存储失败没有任何订阅者或监听器处理时，按未处理错误记录 error 日志。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::broadcast::FreshnessToken;
use crate::key::StoreKey;

/// 触发加载的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadCause {
    /// 容器挂载
    Mount,
    /// 键变更
    KeyChanged,
    /// 其他上下文提交了变更
    External(FreshnessToken),
    /// 调用方手动重新加载
    Manual,
    /// App 回到前台
    Foreground,
    /// 本容器的提交在新一轮加载开始后才落盘，存储内容可能已被它覆盖
    LateCommit,
}

/// 存储操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOperation {
    Read,
    /// 首次使用时写入初始值
    Initialize,
    Write,
    Delete,
}

/// 同步事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 开始加载
    LoadStarted {
        key: StoreKey,
        generation: u64,
        cause: LoadCause,
        timestamp: i64,
    },
    /// 加载完成
    Loaded {
        key: StoreKey,
        generation: u64,
        /// 存储中已有条目
        found: bool,
        /// 写入了初始值
        initialized: bool,
        timestamp: i64,
    },
    /// 过期的异步结果被丢弃
    StaleResultDiscarded {
        key: StoreKey,
        generation: u64,
        operation: StoreOperation,
        timestamp: i64,
    },
    /// 提交完成
    Committed {
        key: StoreKey,
        deleted: bool,
        timestamp: i64,
    },
    /// 收到其他上下文的通知，需要重新加载
    ReloadRequested {
        key: StoreKey,
        token: FreshnessToken,
        timestamp: i64,
    },
    /// 存储操作失败
    StoreFailed {
        key: StoreKey,
        operation: StoreOperation,
        error: String,
        timestamp: i64,
    },
    /// 容器已销毁
    Destroyed {
        key: StoreKey,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::LoadStarted { .. } => "load_started",
            SyncEvent::Loaded { .. } => "loaded",
            SyncEvent::StaleResultDiscarded { .. } => "stale_result_discarded",
            SyncEvent::Committed { .. } => "committed",
            SyncEvent::ReloadRequested { .. } => "reload_requested",
            SyncEvent::StoreFailed { .. } => "store_failed",
            SyncEvent::Destroyed { .. } => "destroyed",
        }
    }

    /// 获取事件关联的键
    pub fn key(&self) -> &StoreKey {
        match self {
            SyncEvent::LoadStarted { key, .. }
            | SyncEvent::Loaded { key, .. }
            | SyncEvent::StaleResultDiscarded { key, .. }
            | SyncEvent::Committed { key, .. }
            | SyncEvent::ReloadRequested { key, .. }
            | SyncEvent::StoreFailed { key, .. }
            | SyncEvent::Destroyed { key, .. } => key,
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::LoadStarted { timestamp, .. }
            | SyncEvent::Loaded { timestamp, .. }
            | SyncEvent::StaleResultDiscarded { timestamp, .. }
            | SyncEvent::Committed { timestamp, .. }
            | SyncEvent::ReloadRequested { timestamp, .. }
            | SyncEvent::StoreFailed { timestamp, .. }
            | SyncEvent::Destroyed { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SyncEvent::StoreFailed { .. })
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 键过滤器
    pub keys: Option<Vec<StoreKey>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加键过滤
    pub fn with_keys(mut self, keys: Vec<StoreKey>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref keys) = self.keys {
            if !keys.contains(event.key()) {
                return false;
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 无人处理的失败事件数
    pub unhandled_failures: u64,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射（"*" 为通用监听器）
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    ///
    /// 监听器在调用方线程上同步执行，不要在持有状态锁时调用。
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {} ({})", event.event_type(), event.key());

        let listeners = self.listeners.read();
        let typed = listeners.get(event.event_type()).map(Vec::len).unwrap_or(0);
        let general = listeners.get("*").map(Vec::len).unwrap_or(0);
        let handled = self.sender.receiver_count() > 0 || typed + general > 0;

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
            if event.is_failure() && !handled {
                stats.unhandled_failures += 1;
            }
        }

        if let SyncEvent::StoreFailed { key, operation, error: message, .. } = &event {
            if !handled {
                error!("❌ 未处理的存储失败: key={}, operation={:?}, error={}", key, operation, message);
            }
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }

        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（event_type 为 "*" 时监听全部事件）
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn load_started(key: &StoreKey, generation: u64, cause: LoadCause) -> SyncEvent {
        SyncEvent::LoadStarted {
            key: key.clone(),
            generation,
            cause,
            timestamp: now(),
        }
    }

    pub fn loaded(key: &StoreKey, generation: u64, found: bool, initialized: bool) -> SyncEvent {
        SyncEvent::Loaded {
            key: key.clone(),
            generation,
            found,
            initialized,
            timestamp: now(),
        }
    }

    pub fn stale_result_discarded(key: &StoreKey, generation: u64, operation: StoreOperation) -> SyncEvent {
        SyncEvent::StaleResultDiscarded {
            key: key.clone(),
            generation,
            operation,
            timestamp: now(),
        }
    }

    pub fn committed(key: &StoreKey, deleted: bool) -> SyncEvent {
        SyncEvent::Committed {
            key: key.clone(),
            deleted,
            timestamp: now(),
        }
    }

    pub fn reload_requested(key: &StoreKey, token: FreshnessToken) -> SyncEvent {
        SyncEvent::ReloadRequested {
            key: key.clone(),
            token,
            timestamp: now(),
        }
    }

    pub fn store_failed(key: &StoreKey, operation: StoreOperation, error: String) -> SyncEvent {
        SyncEvent::StoreFailed {
            key: key.clone(),
            operation,
            error,
            timestamp: now(),
        }
    }

    pub fn destroyed(key: &StoreKey) -> SyncEvent {
        SyncEvent::Destroyed {
            key: key.clone(),
            timestamp: now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);
        let mut receiver = manager.subscribe();

        manager.emit(event_builders::committed(&StoreKey::from("counter"), false));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "committed");
        assert_eq!(received.key().as_str(), "counter");

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("committed"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(100);
        let filter = EventFilter::new()
            .with_event_types(vec!["committed".to_string()])
            .with_keys(vec![StoreKey::from("a")]);
        let mut filtered = manager.subscribe_filtered(filter);

        manager.emit(event_builders::committed(&StoreKey::from("b"), false));
        manager.emit(event_builders::loaded(&StoreKey::from("a"), 1, true, false));
        manager.emit(event_builders::committed(&StoreKey::from("a"), true));

        match filtered.recv().await.unwrap() {
            SyncEvent::Committed { key, deleted, .. } => {
                assert_eq!(key.as_str(), "a");
                assert!(deleted);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(filtered.try_recv().is_err());
    }

    #[test]
    fn test_event_listeners() {
        let manager = EventManager::new(100);
        let counter = Arc::new(AtomicUsize::new(0));
        let typed = counter.clone();
        let general = counter.clone();

        manager.add_listener("committed", move |_| {
            typed.fetch_add(1, Ordering::SeqCst);
        });
        manager.add_listener("*", move |_| {
            general.fetch_add(10, Ordering::SeqCst);
        });

        manager.emit(event_builders::committed(&StoreKey::from("k"), false));
        manager.emit(event_builders::destroyed(&StoreKey::from("k")));

        assert_eq!(counter.load(Ordering::SeqCst), 21);
        assert_eq!(manager.get_stats().listener_count, 2);

        manager.clear_listeners();
        assert_eq!(manager.get_stats().listener_count, 0);
    }

    #[test]
    fn test_unhandled_failures_are_counted() {
        let manager = EventManager::new(100);
        let key = StoreKey::from("k");

        manager.emit(event_builders::store_failed(&key, StoreOperation::Write, "quota".into()));
        assert_eq!(manager.get_stats().unhandled_failures, 1);

        let _receiver = manager.subscribe();
        manager.emit(event_builders::store_failed(&key, StoreOperation::Write, "quota".into()));
        assert_eq!(manager.get_stats().unhandled_failures, 1);
    }
}
