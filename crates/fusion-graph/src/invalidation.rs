//! 失效傳播
//!
//! 沿反向邊做迭代式深度優先走訪。每個節點只會轉換一次狀態，
//! 已失效或版本不符的相依者直接略過。

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;

use crate::graph::GraphInner;
use crate::node::{InvalidationStart, Node, UsedByEdge};

/// 節點計時器
///
/// 計時器持有節點的強引用；同一節點同一種類最多只有一個計時器。
#[derive(Clone)]
pub enum NodeTimer {
    /// 值（或錯誤）到期後失效
    AutoInvalidate(Arc<Node>),
    /// 延遲失效
    DelayedInvalidate(Arc<Node>),
    /// 保持存活（最短快取時間）
    KeepAlive(Arc<Node>),
}

impl NodeTimer {
    pub fn node(&self) -> &Arc<Node> {
        match self {
            NodeTimer::AutoInvalidate(node)
            | NodeTimer::DelayedInvalidate(node)
            | NodeTimer::KeepAlive(node) => node,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            NodeTimer::AutoInvalidate(_) => 0,
            NodeTimer::DelayedInvalidate(_) => 1,
            NodeTimer::KeepAlive(_) => 2,
        }
    }
}

impl PartialEq for NodeTimer {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.node().id() == other.node().id()
    }
}

impl Eq for NodeTimer {}

impl Hash for NodeTimer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.node().id().hash(state);
    }
}

impl std::fmt::Debug for NodeTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeTimer::AutoInvalidate(_) => "AutoInvalidate",
            NodeTimer::DelayedInvalidate(_) => "DelayedInvalidate",
            NodeTimer::KeepAlive(_) => "KeepAlive",
        };
        f.debug_tuple(name).field(&self.node().id()).finish()
    }
}

impl GraphInner {
    /// 使節點及其所有相依者失效，回傳實際失效的節點數
    ///
    /// `immediate` 只作用在起點；相依者若設有失效延遲會改為排程。
    pub(crate) fn invalidate_node(&self, root: &Arc<Node>, immediate: bool) -> usize {
        let mut stack = vec![(root.clone(), immediate)];
        let mut invalidated = 0;

        while let Some((node, immediate)) = stack.pop() {
            if !immediate {
                if let Some(delay) = node.options().invalidation_delay.filter(|d| !d.is_zero()) {
                    self.schedule_delayed_invalidation(&node, delay);
                    continue;
                }
            }

            let dependents = match node.start_invalidation() {
                InvalidationStart::Started(dependents) => dependents,
                InvalidationStart::Deferred => {
                    tracing::debug!("節點 {} 計算中，完成後失效", node.input());
                    continue;
                }
                InvalidationStart::AlreadyInvalidated => continue,
            };

            invalidated += 1;
            self.registry.remove(&node);
            self.remove_timers(&node);
            node.run_invalidation_handlers();
            tracing::debug!("節點已失效: {} ({})", node.input(), node.version());

            for edge in dependents {
                // 過期的邊：相依者已被取代或釋放
                if let Some(dependent) = self.registry.resolve(&edge) {
                    stack.push((dependent, false));
                }
            }
        }

        if invalidated > 1 {
            tracing::debug!("失效傳播完成，共 {} 個節點", invalidated);
        }
        invalidated
    }

    /// 排程延遲失效
    ///
    /// 短於精確門檻的延遲使用獨立的 tokio 計時，其餘交給粗粒度計時器集合。
    fn schedule_delayed_invalidation(&self, node: &Arc<Node>, delay: Duration) {
        if !node.mark_delayed_invalidation() {
            return;
        }

        if delay < self.config.precise_invalidation_delay_threshold {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let graph = self.weak_self.clone();
                let node = node.clone();
                let cancel = self.cancel.clone();
                handle.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            if let Some(graph) = graph.upgrade() {
                                graph.invalidate_node(&node, true);
                            }
                        }
                    }
                });
                return;
            }
        }

        let due = self.timers.clock().now() + delay;
        self.timers
            .add_or_update_to_earlier(NodeTimer::DelayedInvalidate(node.clone()), due);
    }

    /// 在指定延遲後失效（只會提前，不會延後）
    pub(crate) fn invalidate_after(&self, node: &Arc<Node>, delay: Duration) {
        if delay.is_zero() {
            self.invalidate_node(node, true);
            return;
        }
        let due = self.timers.clock().now() + delay;
        self.timers
            .add_or_update_to_earlier(NodeTimer::AutoInvalidate(node.clone()), due);
    }

    /// 延長節點的存活時間
    pub(crate) fn renew_keep_alive(&self, node: &Arc<Node>) {
        let Some(duration) = node.options().min_cache_duration else {
            return;
        };
        if !node.is_consistent() {
            return;
        }
        let due = self.timers.clock().now() + duration;
        self.timers
            .add_or_update_to_later(NodeTimer::KeepAlive(node.clone()), due);
    }

    fn remove_timers(&self, node: &Arc<Node>) {
        self.timers.remove(&NodeTimer::AutoInvalidate(node.clone()));
        self.timers.remove(&NodeTimer::DelayedInvalidate(node.clone()));
        self.timers.remove(&NodeTimer::KeepAlive(node.clone()));
    }

    /// 計時器觸發
    pub(crate) fn on_timer(&self, timer: NodeTimer) {
        match timer {
            NodeTimer::AutoInvalidate(node) | NodeTimer::DelayedInvalidate(node) => {
                self.invalidate_node(&node, true);
            }
            // 釋放強引用即可
            NodeTimer::KeepAlive(_) => {}
        }
    }

    /// 移除單一節點的過期反向邊
    pub(crate) fn prune_node(&self, node: &Node) -> usize {
        let stale: Vec<UsedByEdge> = node
            .used_by()
            .into_iter()
            .filter(|edge| self.registry.resolve(edge).is_none())
            .collect();
        node.remove_used_by(&stale)
    }

    /// 平行修剪所有存活節點，回傳移除的反向邊數量
    pub(crate) fn prune_all(&self) -> usize {
        let nodes = self.registry.live_nodes();
        let removed: usize = nodes.par_iter().map(|node| self.prune_node(node)).sum();
        tracing::debug!("修剪 {} 個節點，移除 {} 條過期反向邊", nodes.len(), removed);
        removed
    }
}
