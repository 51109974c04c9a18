//! 进程内广播 - 基于 tokio broadcast 的同进程多上下文通知

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{BroadcastSubscription, BroadcastTransport, ContextId, Envelope, FreshnessToken};
use crate::config::SyncedStateConfig;
use crate::error::Result;

/// 广播中心：同一通道名下所有上下文共享
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    channel_name: String,
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastHub {
    pub fn new<S: Into<String>>(channel_name: S, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            channel_name: channel_name.into(),
            sender,
        }
    }

    /// 按配置中的通道名和缓冲区大小创建
    pub fn from_config(config: &SyncedStateConfig) -> Self {
        Self::new(config.channel_name.clone(), config.broadcast_capacity)
    }

    /// 加入通道，得到一个新上下文的传输
    pub fn join(&self) -> LocalBroadcast {
        LocalBroadcast {
            context: ContextId::new(),
            channel_name: self.channel_name.clone(),
            sender: self.sender.clone(),
        }
    }

    /// 当前订阅数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 某个上下文在进程内广播通道上的端点
#[derive(Debug, Clone)]
pub struct LocalBroadcast {
    context: ContextId,
    channel_name: String,
    sender: broadcast::Sender<Envelope>,
}

#[async_trait]
impl BroadcastTransport for LocalBroadcast {
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
        // 没有订阅者时 send 会失败，属正常场景（只有一个上下文）
        if let Err(e) = self.sender.send(envelope) {
            debug!("广播无活跃订阅者: {}", e);
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<BroadcastSubscription> {
        let receiver = self.sender.subscribe();
        let me = self.context;

        let stream = futures::stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.origin == me => continue,
                    Ok(envelope) => return Some((envelope.token, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // 丢失了通知，不知道谁变了，按有变化处理
                        debug!("广播接收落后，跳过 {} 条通知", skipped);
                        return Some((FreshnessToken::now(), receiver));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(BroadcastSubscription::new(Box::pin(stream)))
    }
}
