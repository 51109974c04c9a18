//! 基于 sled 写入 + watch 的广播
//!
//! 发布即向共享 Tree 写入通道键，订阅方通过 `watch_prefix` 观察写入事件。
//! 所有共享同一个 sled 数据库的上下文都能收到通知，通过信封中的来源过滤自身写入。

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BroadcastSubscription, BroadcastTransport, ContextId, Envelope, FreshnessToken};
use crate::error::{Result, SyncedStateError};

/// 广播专用 Tree
const BROADCAST_TREE: &str = "__synced_state_broadcast";
/// 订阅转发队列长度
const FORWARD_BUFFER: usize = 64;

/// sled 广播端点
#[derive(Debug, Clone)]
pub struct SledBroadcast {
    context: ContextId,
    channel_name: String,
    tree: ::sled::Tree,
    poll_interval: Duration,
}

impl SledBroadcast {
    /// 在共享数据库上为一个新上下文创建广播端点
    ///
    /// `poll_interval` 决定订阅线程检查取消订阅的频率。
    pub fn new<S: Into<String>>(db: &::sled::Db, channel_name: S, poll_interval: Duration) -> Result<Self> {
        let tree = db
            .open_tree(BROADCAST_TREE)
            .map_err(|e| SyncedStateError::BroadcastUnavailable(format!("打开广播 Tree 失败: {}", e)))?;

        Ok(Self {
            context: ContextId::new(),
            channel_name: channel_name.into(),
            tree,
            poll_interval,
        })
    }
}

#[async_trait]
impl BroadcastTransport for SledBroadcast {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    async fn publish(&self, token: FreshnessToken) -> Result<()> {
        let envelope = Envelope {
            origin: self.context,
            token,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.tree
            .insert(self.channel_name.as_bytes(), bytes)
            .map_err(|e| SyncedStateError::BroadcastUnavailable(format!("写入广播键失败: {}", e)))?;
        Ok(())
    }

    fn subscribe(&self) -> Result<BroadcastSubscription> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncedStateError::BroadcastUnavailable(format!("没有可用的异步运行时: {}", e)))?;

        // 在返回前注册 watch，保证订阅建立后的写入不会丢
        let mut subscriber = self.tree.watch_prefix(self.channel_name.as_bytes());
        let (tx, rx) = mpsc::channel::<FreshnessToken>(FORWARD_BUFFER);
        let me = self.context;
        let channel = self.channel_name.clone();
        let poll_interval = self.poll_interval;

        runtime.spawn_blocking(move || {
            debug!("sled 广播订阅线程启动: {}", channel);
            loop {
                if tx.is_closed() {
                    break;
                }
                match subscriber.next_timeout(poll_interval) {
                    Ok(::sled::Event::Insert { key, value }) => {
                        if &key[..] != channel.as_bytes() {
                            continue;
                        }
                        let envelope: Envelope = match serde_json::from_slice(&value) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("无法解析广播信封: {}", e);
                                continue;
                            }
                        };
                        if envelope.origin == me {
                            continue;
                        }
                        if tx.blocking_send(envelope.token).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("sled 广播订阅线程退出: {}", channel);
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|token| (token, rx))
        });
        Ok(BroadcastSubscription::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_sled_broadcast_between_contexts() {
        let store = SledStore::temporary().unwrap();
        let tab_a = SledBroadcast::new(store.db(), "test", POLL).unwrap();
        let tab_b = SledBroadcast::new(store.db(), "test", POLL).unwrap();

        let mut sub_a = tab_a.subscribe().unwrap();
        let mut sub_b = tab_b.subscribe().unwrap();

        let token = FreshnessToken::now();
        tab_a.publish(token).await.unwrap();

        let received = timeout(Duration::from_secs(2), sub_b.recv()).await.unwrap();
        assert_eq!(received, Some(token));

        let own = timeout(Duration::from_millis(150), sub_a.recv()).await;
        assert!(own.is_err(), "自己发布的通知不应投递给自己");
    }

    #[tokio::test]
    async fn test_sled_broadcast_channels_are_isolated() {
        let store = SledStore::temporary().unwrap();
        let sender = SledBroadcast::new(store.db(), "alpha", POLL).unwrap();
        let other_channel = SledBroadcast::new(store.db(), "alpha-2", POLL).unwrap();

        let mut sub = other_channel.subscribe().unwrap();
        sender.publish(FreshnessToken::now()).await.unwrap();

        let received = timeout(Duration::from_millis(150), sub.recv()).await;
        assert!(received.is_err());
    }
}
