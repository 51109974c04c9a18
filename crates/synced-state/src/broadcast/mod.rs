//! 跨上下文通知模块
//!
//! 通知只携带新鲜度令牌（FreshnessToken），不携带任何值：
//! 收到通知的一方必须回到存储重新读取，存储是唯一的事实来源。
//!
//! 传输层保证不把一个上下文自己发布的通知投递回它自己。

pub mod local;
pub mod sled_watch;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use self::local::{BroadcastHub, LocalBroadcast};
pub use self::sled_watch::SledBroadcast;

/// 默认广播通道名
pub const DEFAULT_CHANNEL_NAME: &str = "synced-state";

static NONCE: AtomicU64 = AtomicU64::new(0);

/// 上下文标识（一个上下文 ≈ 一个标签页 / 窗口）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 新鲜度令牌：只表示"有东西变了"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessToken {
    /// 发布时间（UTC 毫秒时间戳）
    pub issued_at_ms: i64,
    /// 进程内递增序号，同一毫秒内的两次发布也不相等
    pub nonce: u64,
}

impl FreshnessToken {
    pub fn now() -> Self {
        Self {
            issued_at_ms: Utc::now().timestamp_millis(),
            nonce: NONCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// 传输层内部的消息信封（携带来源，用于排除自身通知）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub origin: ContextId,
    pub token: FreshnessToken,
}

/// 通知订阅，drop 即取消订阅
pub struct BroadcastSubscription {
    stream: BoxStream<'static, FreshnessToken>,
}

impl BroadcastSubscription {
    pub fn new(stream: BoxStream<'static, FreshnessToken>) -> Self {
        Self { stream }
    }

    /// 接收下一条来自其他上下文的通知；通道关闭时返回 None
    pub async fn recv(&mut self) -> Option<FreshnessToken> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for BroadcastSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSubscription").finish_non_exhaustive()
    }
}

/// 跨上下文广播传输
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// 当前上下文标识
    fn context_id(&self) -> ContextId;

    /// 通道名
    fn channel_name(&self) -> &str;

    /// 发布新鲜度令牌
    async fn publish(&self, token: FreshnessToken) -> Result<()>;

    /// 订阅其他上下文的通知（同步建立，返回时订阅已生效）
    fn subscribe(&self) -> Result<BroadcastSubscription>;
}
