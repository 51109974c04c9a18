//! 同步协议状态机
//!
//! 加载、提交与重新加载的全部状态迁移都在这里同步完成，不涉及任何异步操作：
//! 调用方负责执行返回的存储操作，并在操作完成后把结果交回状态机。
//! 每次加载分配一个新的 generation，结果回来时 generation 不匹配即视为过期。

use crate::error::SyncedStateError;
use crate::key::StoreKey;

use super::{SetAction, Snapshot, StateValue};

/// 最近一次确认与存储一致的值
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted<T> {
    /// 加载尚未完成，不知道存储里是什么
    Unknown,
    /// `Known(None)` 表示存储中没有条目
    Known(Option<T>),
}

/// 一次加载的凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub generation: u64,
    pub key: StoreKey,
}

/// 待执行的提交
#[derive(Debug, Clone, PartialEq)]
pub struct CommitJob<T> {
    pub generation: u64,
    pub key: StoreKey,
    /// None 表示删除
    pub value: Option<T>,
}

/// 读取结果的处理结论
#[derive(Debug)]
pub enum ReadOutcome<T> {
    /// 加载已被取代或容器已销毁
    Stale,
    /// 采用了存储中的值
    Adopted,
    /// 存储为空，需要写入当前内存值作为初始值
    Initialize(T),
    /// 存储和内存都为空
    Empty,
    Failed(SyncedStateError),
}

/// 写入结果的处理结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Stale,
    Settled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deps {
    value: u64,
    loading: bool,
    persisted: u64,
}

pub struct Core<T> {
    /// 最新的键参数
    key: StoreKey,
    /// 提交的目标键，加载完成后才更新
    current_key: Option<StoreKey>,
    value: Option<T>,
    loading: bool,
    last_persisted: Persisted<T>,
    reload_trigger: u64,
    generation: u64,
    /// 本代已入队、尚未完成的提交数
    pending_commits: usize,
    /// 本代最后一次入队提交的值
    last_enqueued: Option<Option<T>>,
    value_version: u64,
    persisted_version: u64,
    /// 提交副作用上次求值时的依赖
    observed: Option<Deps>,
    destroyed: bool,
}

impl<T: StateValue> Core<T> {
    pub fn new(key: StoreKey, initial: Option<T>) -> Self {
        Self {
            key,
            current_key: None,
            value: initial,
            loading: true,
            last_persisted: Persisted::Unknown,
            reload_trigger: 0,
            generation: 0,
            pending_commits: 0,
            last_enqueued: None,
            value_version: 0,
            persisted_version: 0,
            observed: None,
            destroyed: false,
        }
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn current_key(&self) -> Option<&StoreKey> {
        self.current_key.as_ref()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn last_persisted(&self) -> &Persisted<T> {
        &self.last_persisted
    }

    pub fn reload_trigger(&self) -> u64 {
        self.reload_trigger
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            key: self.key.clone(),
            value: self.value.clone(),
            loading: self.loading,
            reload_trigger: self.reload_trigger,
            generation: self.generation,
        }
    }

    /// 开始一次加载：立即进入 loading，之前所有加载的结果作废
    pub fn begin_load(&mut self) -> Option<LoadTicket> {
        if self.destroyed {
            return None;
        }
        self.generation += 1;
        self.loading = true;
        self.last_persisted = Persisted::Unknown;
        self.persisted_version += 1;
        self.pending_commits = 0;
        self.last_enqueued = None;
        Some(LoadTicket {
            generation: self.generation,
            key: self.key.clone(),
        })
    }

    /// 切换键；键未变化时不加载
    pub fn set_key(&mut self, key: StoreKey) -> Option<LoadTicket> {
        if self.destroyed || key == self.key {
            return None;
        }
        self.key = key;
        self.begin_load()
    }

    /// 递增重新加载令牌，对当前键重新加载
    pub fn bump_reload(&mut self) -> Option<LoadTicket> {
        if self.destroyed {
            return None;
        }
        self.reload_trigger += 1;
        self.begin_load()
    }

    fn is_live(&self, ticket: &LoadTicket) -> bool {
        !self.destroyed && ticket.generation == self.generation
    }

    /// 处理读取结果
    pub fn apply_read(
        &mut self,
        ticket: &LoadTicket,
        result: crate::error::Result<Option<T>>,
    ) -> ReadOutcome<T> {
        if !self.is_live(ticket) {
            return ReadOutcome::Stale;
        }

        match result {
            Err(e) => ReadOutcome::Failed(e),
            Ok(Some(stored)) => {
                self.assign(Some(stored.clone()));
                self.record_persisted(Some(stored));
                self.finish_load(ticket);
                ReadOutcome::Adopted
            }
            Ok(None) => match self.value.clone() {
                Some(initial) => ReadOutcome::Initialize(initial),
                None => {
                    self.record_persisted(None);
                    self.finish_load(ticket);
                    ReadOutcome::Empty
                }
            },
        }
    }

    /// 处理初始值写入结果
    pub fn apply_initial_write(&mut self, ticket: &LoadTicket, written: T, succeeded: bool) -> SettleOutcome {
        if !self.is_live(ticket) {
            return SettleOutcome::Stale;
        }
        if !succeeded {
            return SettleOutcome::Failed;
        }
        self.record_persisted(Some(written));
        self.finish_load(ticket);
        SettleOutcome::Settled
    }

    fn finish_load(&mut self, ticket: &LoadTicket) {
        self.current_key = Some(ticket.key.clone());
        self.loading = false;
    }

    /// 更新内存值，返回值是否变化
    pub fn set(&mut self, action: SetAction<T>) -> bool {
        if self.destroyed {
            return false;
        }
        let next = match action {
            SetAction::Value(value) => value,
            SetAction::Update(update) => update(self.value.as_ref()),
        };
        self.assign(next)
    }

    fn assign(&mut self, next: Option<T>) -> bool {
        if self.value == next {
            return false;
        }
        self.value = next;
        self.value_version += 1;
        true
    }

    fn record_persisted(&mut self, value: Option<T>) {
        self.last_persisted = Persisted::Known(value);
        self.persisted_version += 1;
    }

    /// 提交副作用：依赖（内存值、loading、已持久化值）变化后求值一次
    pub fn commit_effect(&mut self) -> Option<CommitJob<T>> {
        let deps = Deps {
            value: self.value_version,
            loading: self.loading,
            persisted: self.persisted_version,
        };
        if self.observed == Some(deps) {
            return None;
        }
        self.observed = Some(deps);

        if self.destroyed || self.loading {
            return None;
        }

        // 有提交在途时与最后入队的值比较，否则与已确认的值比较
        let up_to_date = if self.pending_commits > 0 {
            self.last_enqueued.as_ref() == Some(&self.value)
        } else {
            matches!(&self.last_persisted, Persisted::Known(persisted) if *persisted == self.value)
        };
        if up_to_date {
            return None;
        }

        let key = self.current_key.clone()?;
        self.pending_commits += 1;
        self.last_enqueued = Some(self.value.clone());
        Some(CommitJob {
            generation: self.generation,
            key,
            value: self.value.clone(),
        })
    }

    /// 处理提交结果
    pub fn apply_commit(&mut self, job: &CommitJob<T>, succeeded: bool) -> SettleOutcome {
        if self.destroyed || job.generation != self.generation {
            return SettleOutcome::Stale;
        }

        self.pending_commits = self.pending_commits.saturating_sub(1);
        if self.pending_commits == 0 {
            self.last_enqueued = None;
        }

        if !succeeded {
            return SettleOutcome::Failed;
        }
        self.record_persisted(job.value.clone());
        SettleOutcome::Settled
    }

    /// 进入 DESTROYED；返回是否为首次销毁
    pub fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        true
    }
}
