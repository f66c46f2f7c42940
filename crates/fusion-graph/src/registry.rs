//! 節點登錄表與輸入鎖

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use fusion_core::ComputedInput;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::node::{ConsistencyState, Node, UsedByEdge};

/// 輸入 → 節點（弱引用）
///
/// 登錄表不延長節點壽命；沒有任何強引用的節點會在下次修剪時移除。
#[derive(Default)]
pub(crate) struct Registry {
    nodes: DashMap<ComputedInput, Weak<Node>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: &Arc<Node>) {
        self.nodes.insert(node.input().clone(), Arc::downgrade(node));
    }

    pub fn get(&self, input: &ComputedInput) -> Option<Arc<Node>> {
        self.nodes.get(input).and_then(|entry| entry.upgrade())
    }

    /// 取得一致的節點
    pub fn get_consistent(&self, input: &ComputedInput) -> Option<Arc<Node>> {
        self.get(input)
            .filter(|node| node.state() == ConsistencyState::Consistent)
    }

    /// 解析反向邊；相依者已不存在或版本不符時回傳 `None`
    pub fn resolve(&self, edge: &UsedByEdge) -> Option<Arc<Node>> {
        self.get(&edge.input)
            .filter(|node| node.version() == edge.version)
    }

    /// 只在登錄項目仍指向此節點時移除
    pub fn remove(&self, node: &Arc<Node>) -> bool {
        let target = Arc::as_ptr(node);
        self.nodes
            .remove_if(node.input(), |_, entry| Weak::as_ptr(entry) == target)
            .is_some()
    }

    /// 移除已釋放的項目並回傳存活節點
    pub fn live_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.retain(|_, entry| entry.strong_count() > 0);
        self.nodes
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn clear(&self) {
        self.nodes.clear();
    }
}

/// 每個輸入一把非同步鎖，避免同一輸入被同時計算
#[derive(Default)]
pub(crate) struct InputLocks {
    locks: DashMap<ComputedInput, Arc<AsyncMutex<()>>>,
}

impl InputLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, input: &ComputedInput) -> InputLockGuard<'_> {
        let lock = self
            .locks
            .entry(input.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        InputLockGuard {
            locks: self,
            input: input.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

/// 輸入鎖守衛：釋放後若沒有其他等待者則移除鎖項目
pub(crate) struct InputLockGuard<'a> {
    locks: &'a InputLocks,
    input: ComputedInput,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InputLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.input, |_, lock| Arc::strong_count(lock) == 1);
    }
}
