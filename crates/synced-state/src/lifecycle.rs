//! 生命周期管理
//!
//! App 前后台切换时统一通知所有同步状态：切到后台前刷新未完成的提交，
//! 回到前台后重新加载，补上后台期间其他上下文的变更。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

/// 生命周期回调 Hook
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册 Hook，按注册顺序通知
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 某个 Hook 失败不影响其余 Hook，返回第一个错误。
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 App 切换到后台，刷新同步状态");

        let mut first_error = None;
        let mut failed = 0usize;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个 Hook 后台切换失败", failed);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 App 切换到前台，重新加载同步状态");

        let mut first_error = None;
        let mut failed = 0usize;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个 Hook 前台切换失败", failed);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncedStateError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        background: AtomicUsize,
        foreground: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.background.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncedStateError::StoreUnavailable("closed".into()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notify_all_hooks() {
        let first = Arc::new(CountingHook::default());
        let second = Arc::new(CountingHook::default());
        let mut manager = LifecycleManager::new();
        manager.register_hook(first.clone());
        manager.register_hook(second.clone());
        assert_eq!(manager.hook_count(), 2);

        manager.notify_background().await.unwrap();
        manager.notify_foreground().await.unwrap();

        assert_eq!(first.background.load(Ordering::SeqCst), 1);
        assert_eq!(second.foreground.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let failing = Arc::new(CountingHook {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(CountingHook::default());
        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());

        let result = manager.notify_background().await;
        assert!(matches!(result, Err(SyncedStateError::StoreUnavailable(_))));
        assert_eq!(healthy.background.load(Ordering::SeqCst), 1);
    }
}
