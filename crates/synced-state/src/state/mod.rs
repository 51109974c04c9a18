//! 持久化同步状态
//!
//! `SyncedState<T>` 把一个内存值和键值存储中的一个键绑定：
//! - 挂载或键变更时从存储加载，存储为空时写入初始值
//! - 加载完成后每次变更都按顺序写回存储（值为 None 时删除）
//! - 每次写入成功后向其他上下文广播新鲜度令牌，收到令牌的上下文重新加载
//!
//! 状态迁移全部在 [`machine::Core`] 中同步完成，本模块负责执行存储 IO、
//! 运行提交队列和跨上下文监听任务。

pub mod machine;


use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::machine::{CommitJob, Core, LoadTicket, ReadOutcome, SettleOutcome};
use crate::broadcast::{BroadcastTransport, FreshnessToken};
use crate::environment::SyncEnvironment;
use crate::error::{Result, SyncedStateError};
use crate::events::{event_builders, EventManager, LoadCause, StoreOperation, SyncEvent};
use crate::key::{StoreHandle, StoreKey};
use crate::lifecycle::LifecycleHook;
use crate::store::{decode_value, encode_value, KeyValueStore};

/// 可被同步状态持有的值
pub trait StateValue: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// 基于前值计算新值的更新函数
pub type UpdateFn<T> = Box<dyn FnOnce(Option<&T>) -> Option<T> + Send>;

/// 一次设值操作
pub enum SetAction<T> {
    /// 直接替换；None 表示删除
    Value(Option<T>),
    /// 基于最新值计算
    Update(UpdateFn<T>),
}

impl<T> std::fmt::Debug for SetAction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetAction::Value(_) => f.write_str("SetAction::Value(..)"),
            SetAction::Update(_) => f.write_str("SetAction::Update(..)"),
        }
    }
}

/// 对外可见的状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub key: StoreKey,
    pub value: Option<T>,
    pub loading: bool,
    /// 每次跨上下文通知或手动重新加载递增
    pub reload_trigger: u64,
    pub generation: u64,
}

enum CommitCommand<T> {
    Write(CommitJob<T>),
    /// 之前入队的提交全部完成后回复
    Flush(oneshot::Sender<()>),
}

/// 一次迁移产生的副作用，在释放状态锁后执行
struct Effects<T> {
    events: Vec<SyncEvent>,
    load: Option<LoadTicket>,
    initial_write: Option<(LoadTicket, T)>,
}

impl<T> Effects<T> {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            load: None,
            initial_write: None,
        }
    }

    fn start_load(&mut self, ticket: LoadTicket, cause: LoadCause) {
        self.events
            .push(event_builders::load_started(&ticket.key, ticket.generation, cause));
        self.load = Some(ticket);
    }
}

struct Shared<T: StateValue> {
    core: Mutex<Core<T>>,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn BroadcastTransport>>,
    events: Arc<EventManager>,
    store_handle: StoreHandle,
    snapshot_tx: watch::Sender<Snapshot<T>>,
    commit_tx: Option<mpsc::UnboundedSender<CommitCommand<T>>>,
    /// 挂载时所在的运行时；任意线程上的迁移都把任务投递到这里
    runtime: Option<Handle>,
    shutdown: CancellationToken,
}

impl<T: StateValue> Shared<T> {
    /// 在状态锁内执行迁移，随后求值提交副作用并发布快照
    fn transition<R>(self: &Arc<Self>, f: impl FnOnce(&mut Core<T>, &mut Effects<T>) -> R) -> R {
        let mut effects = Effects::new();
        let result = {
            let mut core = self.core.lock();
            let result = f(&mut core, &mut effects);
            // 入队在锁内完成，保证提交顺序与变更顺序一致
            if let Some(job) = core.commit_effect() {
                self.enqueue_commit(job);
            }
            self.snapshot_tx.send_replace(core.snapshot());
            result
        };

        for event in effects.events {
            self.events.emit(event);
        }
        if let Some(ticket) = effects.load {
            self.spawn_load(ticket);
        }
        if let Some((ticket, value)) = effects.initial_write {
            self.spawn_initial_write(ticket, value);
        }
        result
    }

    fn enqueue_commit(&self, job: CommitJob<T>) {
        match &self.commit_tx {
            Some(tx) => {
                debug!("📝 提交入队: key={}, delete={}", job.key, job.value.is_none());
                if tx.send(CommitCommand::Write(job)).is_err() {
                    debug!("提交队列已关闭，丢弃提交");
                }
            }
            None => debug!("无存储环境，跳过提交"),
        }
    }

    fn spawn_load(self: &Arc<Self>, ticket: LoadTicket) {
        let (Some(store), Some(runtime)) = (self.store.clone(), self.runtime.as_ref()) else {
            debug!("无存储环境，跳过加载: key={}", ticket.key);
            return;
        };
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            let result = match store.get(&ticket.key, &shared.store_handle).await {
                Ok(Some(bytes)) => decode_value::<T>(&bytes).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            shared.settle_read(ticket, result);
        });
    }

    fn settle_read(self: &Arc<Self>, ticket: LoadTicket, result: Result<Option<T>>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.transition(|core, fx| match core.apply_read(&ticket, result) {
            ReadOutcome::Stale => {
                debug!("🗑️ 丢弃过期的读取结果: key={}, generation={}", ticket.key, ticket.generation);
                fx.events.push(event_builders::stale_result_discarded(
                    &ticket.key,
                    ticket.generation,
                    StoreOperation::Read,
                ));
            }
            ReadOutcome::Adopted => {
                debug!("✅ 已采用存储中的值: key={}", ticket.key);
                fx.events
                    .push(event_builders::loaded(&ticket.key, ticket.generation, true, false));
            }
            ReadOutcome::Empty => {
                fx.events
                    .push(event_builders::loaded(&ticket.key, ticket.generation, false, false));
            }
            ReadOutcome::Initialize(value) => {
                fx.initial_write = Some((ticket.clone(), value));
            }
            ReadOutcome::Failed(e) => {
                warn!("⚠️ 读取失败，保持 loading: key={}, error={}", ticket.key, e);
                fx.events
                    .push(event_builders::store_failed(&ticket.key, StoreOperation::Read, e.to_string()));
            }
        });
    }

    fn spawn_initial_write(self: &Arc<Self>, ticket: LoadTicket, value: T) {
        let (Some(store), Some(runtime)) = (self.store.clone(), self.runtime.as_ref()) else {
            return;
        };
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            let result = match encode_value(&value) {
                Ok(bytes) => store.set(&ticket.key, bytes, &shared.store_handle).await,
                Err(e) => Err(e),
            };
            shared.settle_initial_write(ticket, value, result);
        });
    }

    fn settle_initial_write(self: &Arc<Self>, ticket: LoadTicket, value: T, result: Result<()>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let error = result.err();
        self.transition(|core, fx| match core.apply_initial_write(&ticket, value, error.is_none()) {
            SettleOutcome::Stale => {
                debug!("🗑️ 丢弃过期的初始化结果: key={}", ticket.key);
                fx.events.push(event_builders::stale_result_discarded(
                    &ticket.key,
                    ticket.generation,
                    StoreOperation::Initialize,
                ));
            }
            SettleOutcome::Settled => {
                debug!("✅ 已写入初始值: key={}", ticket.key);
                fx.events
                    .push(event_builders::loaded(&ticket.key, ticket.generation, false, true));
            }
            SettleOutcome::Failed => {
                let message = error.as_ref().map(ToString::to_string).unwrap_or_default();
                warn!("⚠️ 初始值写入失败，保持 loading: key={}, error={}", ticket.key, message);
                fx.events
                    .push(event_builders::store_failed(&ticket.key, StoreOperation::Initialize, message));
            }
        });
    }

    /// 执行一次提交；由提交队列串行调用
    async fn execute_commit(self: &Arc<Self>, job: CommitJob<T>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let operation = if job.value.is_some() {
            StoreOperation::Write
        } else {
            StoreOperation::Delete
        };
        let result = match &job.value {
            Some(value) => match encode_value(value) {
                Ok(bytes) => store.set(&job.key, bytes, &self.store_handle).await,
                Err(e) => Err(e),
            },
            None => store.delete(&job.key, &self.store_handle).await,
        };

        let error = result.err();
        let succeeded = error.is_none();

        // 已销毁：写入照常生效，只是不再更新状态
        if self.shutdown.is_cancelled() {
            match &error {
                None => debug!("销毁后完成的提交: key={}", job.key),
                Some(e) => warn!("⚠️ 销毁后提交失败: key={}, error={}", job.key, e),
            }
        } else {
            self.settle_commit(&job, operation, error.as_ref());
        }

        if succeeded {
            self.announce().await;
        }
    }

    fn settle_commit(self: &Arc<Self>, job: &CommitJob<T>, operation: StoreOperation, error: Option<&SyncedStateError>) {
        self.transition(|core, fx| {
            let outcome = core.apply_commit(job, error.is_none());
            if outcome == SettleOutcome::Stale {
                debug!("提交完成时已进入新的加载: key={}, generation={}", job.key, job.generation);
                // 新一轮加载可能先于这次写入读到旧值，重新读一次
                if error.is_none() && core.key() == &job.key {
                    if let Some(ticket) = core.begin_load() {
                        fx.start_load(ticket, LoadCause::LateCommit);
                    }
                }
            }
            match error {
                None => fx
                    .events
                    .push(event_builders::committed(&job.key, operation == StoreOperation::Delete)),
                Some(e) => {
                    warn!("⚠️ 提交失败，不自动重试: key={}, error={}", job.key, e);
                    fx.events
                        .push(event_builders::store_failed(&job.key, operation, e.to_string()));
                }
            }
        });
    }

    /// 广播新鲜度令牌；广播不可用时静默降级
    async fn announce(&self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let token = FreshnessToken::now();
        match transport.publish(token).await {
            Ok(()) => debug!("📣 已广播变更: channel={}, nonce={}", transport.channel_name(), token.nonce),
            Err(e) => debug!("广播不可用，忽略: {}", e),
        }
    }

    fn external_change(self: &Arc<Self>, token: FreshnessToken) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.transition(|core, fx| {
            fx.events.push(event_builders::reload_requested(core.key(), token));
            if let Some(ticket) = core.bump_reload() {
                fx.start_load(ticket, LoadCause::External(token));
            }
        });
    }

    fn reload(self: &Arc<Self>, cause: LoadCause) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.transition(|core, fx| {
            if let Some(ticket) = core.bump_reload() {
                fx.start_load(ticket, cause);
            }
        });
    }

    fn apply(self: &Arc<Self>, action: SetAction<T>) {
        if self.shutdown.is_cancelled() {
            debug!("同步状态已销毁，忽略设值");
            return;
        }
        self.transition(|core, _| {
            core.set(action);
        });
    }

    async fn flush(&self) -> Result<()> {
        let Some(tx) = &self.commit_tx else {
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(CommitCommand::Flush(done_tx))
            .map_err(|_| SyncedStateError::Destroyed)?;
        done_rx.await.map_err(|_| SyncedStateError::Destroyed)
    }

    fn spawn_listener(self: &Arc<Self>) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        // 同步订阅，保证挂载后的通知不会丢
        let mut subscription = match transport.subscribe() {
            Ok(subscription) => subscription,
            Err(e) => {
                debug!("广播不可用，跨上下文同步降级: {}", e);
                return;
            }
        };

        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            debug!("👂 跨上下文监听已启动: channel={}", transport.channel_name());
            loop {
                let token = tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    token = subscription.recv() => match token {
                        Some(token) => token,
                        None => break,
                    },
                };
                shared.external_change(token);
            }
            debug!("跨上下文监听已停止: channel={}", transport.channel_name());
        });
    }
}

/// 提交队列：按入队顺序逐个执行
///
/// 销毁后不再等待新命令，但已入队的写入仍会落盘；排在销毁之后的 flush 不会得到回复。
async fn run_commit_worker<T: StateValue>(shared: Arc<Shared<T>>, mut rx: mpsc::UnboundedReceiver<CommitCommand<T>>) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            CommitCommand::Write(job) => shared.execute_commit(job).await,
            CommitCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    let mut drained = 0usize;
    while let Ok(command) = rx.try_recv() {
        if let CommitCommand::Write(job) = command {
            shared.execute_commit(job).await;
            drained += 1;
        }
    }
    debug!("提交队列已退出: 销毁后落盘 {} 个提交", drained);
}

/// 持久化、跨上下文同步的状态容器
///
/// drop 时自动销毁：停止监听和提交队列，之后到达的存储结果全部忽略。
pub struct SyncedState<T: StateValue> {
    shared: Arc<Shared<T>>,
}

impl<T: StateValue> SyncedState<T> {
    pub fn builder<K: Into<StoreKey>>(key: K) -> SyncedStateBuilder<T> {
        SyncedStateBuilder::new(key.into())
    }

    fn spawn(env: &SyncEnvironment, key: StoreKey, initial: Option<T>, store_handle: StoreHandle) -> Self {
        let core = Core::new(key, initial);
        let (snapshot_tx, _) = watch::channel(core.snapshot());
        let runtime = if env.is_headless() {
            None
        } else {
            match Handle::try_current() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("❌ 挂载同步状态需要 tokio 运行时，按无环境模式处理: {}", e);
                    None
                }
            }
        };
        let headless = runtime.is_none();
        let (commit_tx, commit_rx) = if headless {
            (None, None)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        };

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            store: env.store().cloned(),
            transport: env.transport().cloned(),
            events: Arc::clone(env.events()),
            store_handle,
            snapshot_tx,
            commit_tx,
            runtime,
            shutdown: CancellationToken::new(),
        });

        let (Some(commit_rx), Some(runtime)) = (commit_rx, shared.runtime.clone()) else {
            debug!("无存储环境，同步状态保持 loading");
            return Self { shared };
        };

        runtime.spawn(run_commit_worker(Arc::clone(&shared), commit_rx));
        shared.spawn_listener();
        shared.transition(|core, fx| {
            if let Some(ticket) = core.begin_load() {
                fx.start_load(ticket, LoadCause::Mount);
            }
        });
        info!("✅ 同步状态已挂载: key={}, store={}", shared.core.lock().key(), shared.store_handle);

        Self { shared }
    }

    /// 当前值
    pub fn get(&self) -> Option<T> {
        self.shared.core.lock().value().cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.core.lock().is_loading()
    }

    /// 最新的键参数（加载中时可能还不是提交目标）
    pub fn key(&self) -> StoreKey {
        self.shared.core.lock().key().clone()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.shared.core.lock().snapshot()
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.shared.snapshot_tx.subscribe()
    }

    /// `(值, 设值器, loading)`
    pub fn parts(&self) -> (Option<T>, StateSetter<T>, bool) {
        let core = self.shared.core.lock();
        (core.value().cloned(), self.setter(), core.is_loading())
    }

    pub fn setter(&self) -> StateSetter<T> {
        StateSetter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn set(&self, value: T) {
        self.shared.apply(SetAction::Value(Some(value)));
    }

    /// None 会在提交时删除存储中的条目
    pub fn set_value(&self, value: Option<T>) {
        self.shared.apply(SetAction::Value(value));
    }

    pub fn clear(&self) {
        self.shared.apply(SetAction::Value(None));
    }

    /// 基于最新值更新
    ///
    /// 更新函数在状态锁内执行，不能回调本容器。
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(Option<&T>) -> Option<T> + Send + 'static,
    {
        self.shared.apply(SetAction::Update(Box::new(f)));
    }

    /// 切换到另一个键并重新加载
    pub fn set_key<K: Into<StoreKey>>(&self, key: K) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        let key = key.into();
        self.shared.transition(|core, fx| {
            if let Some(ticket) = core.set_key(key) {
                fx.start_load(ticket, LoadCause::KeyChanged);
            }
        });
    }

    /// 手动重新加载当前键
    pub fn reload(&self) {
        self.shared.reload(LoadCause::Manual);
    }

    /// 等待当前加载完成
    ///
    /// 无存储环境下永远不会完成。容器被销毁时返回 [`SyncedStateError::Destroyed`]。
    pub async fn wait_until_loaded(&self) -> Result<()> {
        let mut rx = self.shared.snapshot_tx.subscribe();
        loop {
            if !rx.borrow_and_update().loading {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(SyncedStateError::Destroyed);
                    }
                }
                _ = self.shared.shutdown.cancelled() => return Err(SyncedStateError::Destroyed),
            }
        }
    }

    /// 等待已入队的提交全部完成
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    /// 销毁：停止监听与提交队列，之后的存储结果不再生效
    pub fn destroy(&self) {
        let (first, key) = {
            let mut core = self.shared.core.lock();
            (core.destroy(), core.key().clone())
        };
        if !first {
            return;
        }
        self.shared.shutdown.cancel();
        info!("🧹 同步状态已销毁: key={}", key);
        self.shared.events.emit(event_builders::destroyed(&key));
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.core.lock().is_destroyed()
    }

    /// 生命周期 Hook：切到后台时刷新提交，回到前台时重新加载
    pub fn lifecycle_hook(&self) -> Arc<dyn LifecycleHook> {
        Arc::new(SyncedStateHook {
            shared: Arc::downgrade(&self.shared),
        })
    }
}

impl<T: StateValue> Drop for SyncedState<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T: StateValue + std::fmt::Debug> std::fmt::Debug for SyncedState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedState")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// 设值器，不延长容器的生命周期；容器销毁后调用无效果
pub struct StateSetter<T: StateValue> {
    shared: Weak<Shared<T>>,
}

impl<T: StateValue> Clone for StateSetter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: StateValue> StateSetter<T> {
    pub fn apply(&self, action: SetAction<T>) {
        match self.shared.upgrade() {
            Some(shared) => shared.apply(action),
            None => debug!("同步状态已释放，忽略设值"),
        }
    }

    pub fn set(&self, value: T) {
        self.apply(SetAction::Value(Some(value)));
    }

    pub fn set_value(&self, value: Option<T>) {
        self.apply(SetAction::Value(value));
    }

    pub fn clear(&self) {
        self.apply(SetAction::Value(None));
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(Option<&T>) -> Option<T> + Send + 'static,
    {
        self.apply(SetAction::Update(Box::new(f)));
    }
}

struct SyncedStateHook<T: StateValue> {
    shared: Weak<Shared<T>>,
}

#[async_trait]
impl<T: StateValue> LifecycleHook for SyncedStateHook<T> {
    async fn on_background(&self) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        if shared.shutdown.is_cancelled() {
            return Ok(());
        }
        shared.flush().await
    }

    async fn on_foreground(&self) -> Result<()> {
        if let Some(shared) = self.shared.upgrade() {
            shared.reload(LoadCause::Foreground);
        }
        Ok(())
    }
}

/// 同步状态构建器
pub struct SyncedStateBuilder<T: StateValue> {
    key: StoreKey,
    initial: Option<T>,
    store: Option<StoreHandle>,
}

impl<T: StateValue> SyncedStateBuilder<T> {
    fn new(key: StoreKey) -> Self {
        Self {
            key,
            initial: None,
            store: None,
        }
    }

    /// 存储中没有值时使用并写入的初始值
    pub fn initial(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    /// 惰性初始值，挂载时求值一次
    pub fn initial_with<F: FnOnce() -> T>(mut self, f: F) -> Self {
        self.initial = Some(f());
        self
    }

    /// 存储句柄，默认取环境配置中的 `default_store`
    pub fn store(mut self, store: StoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    /// 在环境中挂载
    ///
    /// 有存储时需要在 tokio 运行时内调用，之后的操作可以在任意线程上进行；
    /// 运行时外挂载按无环境模式处理。
    pub fn spawn(self, env: &SyncEnvironment) -> SyncedState<T> {
        let store = self.store.unwrap_or_else(|| env.config().default_store.clone());
        SyncedState::spawn(env, self.key, self.initial, store)
    }
}
