//! 計算節點
//!
//! 節點保存一次計算的結果（值或錯誤）以及它讀取過的相依節點。
//! 狀態只會 Computing → Consistent → Invalidated 單向前進。
//!
//! 鎖的順序：`used_by` / `handlers` 先於 `state`。
//! 失效時先寫入 `state` 並釋放，再取出 `used_by`，
//! 因此不會有邊在失效後被加入而遺漏。

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fusion_core::{ComputedInput, ComputedOptions, FusionError, Result, Version};
use parking_lot::Mutex;

/// 型別抹除的計算值
pub type ComputedValue = Arc<dyn Any + Send + Sync>;

/// 計算結果：值或錯誤
pub type ComputedOutput = Result<ComputedValue>;

/// 失效處理器
pub type InvalidationHandler = Box<dyn FnOnce(&Node) + Send>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 節點識別碼（行程內唯一，不重複使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputedId(u64);

impl ComputedId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ComputedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一致性狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyState {
    /// 計算中
    Computing,
    /// 已完成且有效
    Consistent,
    /// 已失效（終態）
    Invalidated,
}

/// 反向邊：以（輸入, 版本）指向相依者
///
/// 透過登錄表解析；相依者已不存在或版本不同時視為過期。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsedByEdge {
    pub input: ComputedInput,
    pub version: Version,
}

impl UsedByEdge {
    pub fn of(node: &Node) -> Self {
        Self {
            input: node.input.clone(),
            version: node.version,
        }
    }
}

struct NodeState {
    consistency: ConsistencyState,
    output: Option<ComputedOutput>,
    invalidate_on_complete: bool,
}

/// 完成計算的結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// 節點不在計算中
    Rejected,
    /// 已完成
    Completed,
    /// 已完成，但計算期間收到失效要求，必須立刻失效
    CompletedPendingInvalidation,
}

/// 開始失效的結果
pub(crate) enum InvalidationStart {
    /// 已轉為 Invalidated，附帶取出的反向邊
    Started(Vec<UsedByEdge>),
    /// 計算中，完成後再失效
    Deferred,
    /// 早已失效
    AlreadyInvalidated,
}

/// 計算節點
pub struct Node {
    id: ComputedId,
    input: ComputedInput,
    version: Version,
    options: ComputedOptions,
    state: Mutex<NodeState>,
    used: Mutex<Vec<Arc<Node>>>,
    used_by: Mutex<Vec<UsedByEdge>>,
    handlers: Mutex<Vec<InvalidationHandler>>,
    delayed_invalidation: AtomicBool,
}

impl Node {
    /// 創建計算中的節點
    pub(crate) fn new(input: ComputedInput, version: Version, options: ComputedOptions) -> Self {
        Self {
            id: ComputedId::next(),
            input,
            version,
            options,
            state: Mutex::new(NodeState {
                consistency: ConsistencyState::Computing,
                output: None,
                invalidate_on_complete: false,
            }),
            used: Mutex::new(Vec::new()),
            used_by: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            delayed_invalidation: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ComputedId {
        self.id
    }

    pub fn input(&self) -> &ComputedInput {
        &self.input
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn options(&self) -> &ComputedOptions {
        &self.options
    }

    pub fn state(&self) -> ConsistencyState {
        self.state.lock().consistency
    }

    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    pub fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }

    /// 計算結果（計算中時為 `None`）
    pub fn output(&self) -> Option<ComputedOutput> {
        self.state.lock().output.clone()
    }

    /// 解碼計算值
    pub fn value<T: Clone + 'static>(&self) -> Result<T> {
        match self.output() {
            None => Err(FusionError::NotCompleted(self.input.to_string())),
            Some(Err(error)) => Err(error),
            Some(Ok(value)) => value.downcast_ref::<T>().cloned().ok_or_else(|| {
                FusionError::Internal(format!(
                    "節點 {} 的值型別不是 {}",
                    self.input,
                    std::any::type_name::<T>()
                ))
            }),
        }
    }

    /// 是否以錯誤完成
    pub fn has_error(&self) -> bool {
        matches!(self.state.lock().output, Some(Err(_)))
    }

    fn complete(&self, output: ComputedOutput) -> Completion {
        let mut state = self.state.lock();
        if state.consistency != ConsistencyState::Computing {
            return Completion::Rejected;
        }
        state.output = Some(output);
        state.consistency = ConsistencyState::Consistent;
        if state.invalidate_on_complete {
            Completion::CompletedPendingInvalidation
        } else {
            Completion::Completed
        }
    }

    /// 以值完成計算；節點不在計算中時回傳 `Rejected`
    pub(crate) fn complete_with_value(&self, value: ComputedValue) -> Completion {
        self.complete(Ok(value))
    }

    /// 以錯誤完成計算
    pub(crate) fn complete_with_error(&self, error: FusionError) -> Completion {
        self.complete(Err(error))
    }

    /// 記錄相依節點（只在計算中有效）
    pub fn add_used(&self, dependency: Arc<Node>) {
        let state = self.state.lock();
        if state.consistency != ConsistencyState::Computing {
            return;
        }
        self.used.lock().push(dependency);
    }

    /// 記錄相依者，節點已失效時回傳 false
    pub fn add_used_by(&self, edge: UsedByEdge) -> bool {
        let mut used_by = self.used_by.lock();
        if self.state() == ConsistencyState::Invalidated {
            return false;
        }
        used_by.push(edge);
        true
    }

    /// 相依節點
    pub fn used(&self) -> Vec<Arc<Node>> {
        self.used.lock().clone()
    }

    pub fn used_by(&self) -> Vec<UsedByEdge> {
        self.used_by.lock().clone()
    }

    pub fn used_by_count(&self) -> usize {
        self.used_by.lock().len()
    }

    /// 移除指定的反向邊，回傳移除數量
    pub(crate) fn remove_used_by(&self, stale: &[UsedByEdge]) -> usize {
        if stale.is_empty() {
            return 0;
        }
        let mut used_by = self.used_by.lock();
        let before = used_by.len();
        used_by.retain(|edge| !stale.contains(edge));
        before - used_by.len()
    }

    /// 註冊失效處理器；節點已失效時立即執行
    pub fn on_invalidated(&self, handler: impl FnOnce(&Node) + Send + 'static) {
        let mut handlers = self.handlers.lock();
        if self.state() == ConsistencyState::Invalidated {
            drop(handlers);
            handler(self);
            return;
        }
        handlers.push(Box::new(handler));
    }

    /// 開始失效
    pub(crate) fn start_invalidation(&self) -> InvalidationStart {
        {
            let mut state = self.state.lock();
            match state.consistency {
                ConsistencyState::Invalidated => return InvalidationStart::AlreadyInvalidated,
                ConsistencyState::Computing => {
                    state.invalidate_on_complete = true;
                    return InvalidationStart::Deferred;
                }
                ConsistencyState::Consistent => {
                    state.consistency = ConsistencyState::Invalidated;
                }
            }
        }
        self.used.lock().clear();
        InvalidationStart::Started(std::mem::take(&mut *self.used_by.lock()))
    }

    /// 執行並清空失效處理器
    pub(crate) fn run_invalidation_handlers(&self) {
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers {
            handler(self);
        }
    }

    /// 標記已排程延遲失效，已排程過時回傳 false
    pub(crate) fn mark_delayed_invalidation(&self) -> bool {
        !self.delayed_invalidation.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("input", &self.input.to_string())
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}
