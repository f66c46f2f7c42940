//! 計算圖主引擎

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fusion_core::clock::{default_clock, MomentClock};
use fusion_core::{
    ComputedInput, ComputedOptions, FusionConfig, FusionError, Result, TransiencyResolver,
    VersionGenerator,
};
use fusion_timer::{ConcurrentTimerSet, TimerSetOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{ComputeContext, Frame};
use crate::invalidation::NodeTimer;
use crate::node::{Completion, ComputedOutput, ComputedValue, Node, UsedByEdge};
use crate::registry::{InputLocks, Registry};

pub(crate) struct GraphInner {
    pub(crate) config: FusionConfig,
    pub(crate) registry: Registry,
    pub(crate) locks: InputLocks,
    pub(crate) versions: VersionGenerator,
    pub(crate) timers: ConcurrentTimerSet<NodeTimer>,
    pub(crate) resolver: TransiencyResolver,
    pub(crate) cancel: CancellationToken,
    pub(crate) weak_self: Weak<GraphInner>,
}

impl GraphInner {
    /// 讀取節點：依最上層框架記錄相依邊或擷取
    ///
    /// 節點已失效而無法記錄反向邊時回傳 false。
    fn register_read(&self, ctx: &ComputeContext, node: &Arc<Node>) -> bool {
        match ctx.top() {
            Some(Frame::Compute(parent)) => {
                if !node.add_used_by(UsedByEdge::of(&parent)) {
                    return false;
                }
                parent.add_used(node.clone());
                true
            }
            Some(Frame::Capture(slot)) | Some(Frame::CaptureExisting(slot)) => {
                *slot.lock() = Some(node.clone());
                true
            }
            _ => true,
        }
    }

    /// 完成節點並安排錯誤存活時間、自動失效與保持存活
    fn complete(&self, node: &Arc<Node>, output: ComputedOutput) {
        let error = output.as_ref().err().cloned();
        let completion = match output {
            Ok(value) => node.complete_with_value(value),
            Err(error) => node.complete_with_error(error),
        };
        match completion {
            Completion::Rejected => return,
            Completion::CompletedPendingInvalidation => {
                self.invalidate_node(node, true);
                return;
            }
            Completion::Completed => {}
        }

        match error {
            Some(error) if error.is_cancellation() => {
                self.invalidate_node(node, true);
                return;
            }
            Some(error) => {
                let transient = self.resolver.resolve(&error).is_transient();
                let lifetime = node.options().error_lifetime(transient);
                tracing::debug!("節點 {} 以錯誤完成，快取 {:?}: {}", node.input(), lifetime, error);
                self.invalidate_after(node, lifetime);
            }
            None => {
                if let Some(delay) = node.options().auto_invalidation_delay {
                    self.invalidate_after(node, delay);
                }
            }
        }
        self.renew_keep_alive(node);
    }
}

/// 計算中守衛：評估被取消（future 被丟棄）時以取消錯誤完成並失效
struct ComputingGuard<'a> {
    inner: &'a GraphInner,
    node: Option<Arc<Node>>,
}

impl ComputingGuard<'_> {
    fn disarm(&mut self) {
        self.node = None;
    }
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            tracing::debug!("計算已取消: {}", node.input());
            node.complete_with_error(FusionError::Cancelled);
            self.inner.invalidate_node(&node, true);
        }
    }
}

/// 計算圖
///
/// 記憶化無副作用的讀取，記錄讀取之間的相依關係，
/// 並在輸入改變時沿相依關係傳播失效。
#[derive(Clone)]
pub struct ComputedGraph {
    inner: Arc<GraphInner>,
}

impl ComputedGraph {
    /// 創建新的計算圖（在 tokio 執行環境內會啟動計時器驅動器）
    pub fn new(config: FusionConfig) -> Self {
        Self::with_parts(config, default_clock(), TransiencyResolver::default())
    }

    /// 以指定時鐘與暫時性分類器創建
    pub fn with_parts(
        config: FusionConfig,
        clock: Arc<dyn MomentClock>,
        resolver: TransiencyResolver,
    ) -> Self {
        let timer_options = TimerSetOptions::from_config(&config).with_clock(clock);
        let inner = Arc::new_cyclic(|weak: &Weak<GraphInner>| {
            let target = weak.clone();
            let timers = ConcurrentTimerSet::new(timer_options, move |timer: NodeTimer| {
                if let Some(inner) = target.upgrade() {
                    inner.on_timer(timer);
                }
            });
            GraphInner {
                config,
                registry: Registry::new(),
                locks: InputLocks::new(),
                versions: VersionGenerator::new(),
                timers,
                resolver,
                cancel: CancellationToken::new(),
                weak_self: weak.clone(),
            }
        });

        tracing::info!(
            "計算圖已建立：刻度 {:?}，計時器分片 {}",
            inner.config.tick_resolution,
            inner.config.timer_concurrency
        );
        Self { inner }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.inner.config
    }

    /// 以預設選項計算（或取用快取）
    pub async fn compute<T, F>(&self, ctx: &ComputeContext, input: ComputedInput, evaluation: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = Result<T>>,
    {
        let options = self.inner.config.default_options.clone();
        self.compute_with(ctx, input, options, evaluation).await
    }

    /// 以指定選項計算（或取用快取）
    pub async fn compute_with<T, F>(
        &self,
        ctx: &ComputeContext,
        input: ComputedInput,
        options: ComputedOptions,
        evaluation: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = Result<T>>,
    {
        let evaluation = async move { evaluation.await.map(|value| Arc::new(value) as ComputedValue) };
        let node = self.compute_node(ctx, input, options, evaluation).await?;
        node.value::<T>()
    }

    /// 取得（必要時計算）輸入對應的節點
    ///
    /// `evaluation` 是惰性的：命中快取時不會被輪詢。
    /// 評估期間 `ctx` 的最上層是此節點的計算框架，透過 `ctx` 的讀取會記錄為相依。
    pub async fn compute_node<F>(
        &self,
        ctx: &ComputeContext,
        input: ComputedInput,
        options: ComputedOptions,
        evaluation: F,
    ) -> Result<Arc<Node>>
    where
        F: Future<Output = ComputedOutput>,
    {
        match ctx.top() {
            Some(Frame::Invalidation) => {
                if let Some(node) = self.inner.registry.get(&input) {
                    self.inner.invalidate_node(&node, false);
                }
                return Err(FusionError::InvalidationOnly);
            }
            Some(Frame::CaptureExisting(slot)) => {
                let node = self.get_existing(&input)?;
                *slot.lock() = Some(node.clone());
                return Ok(node);
            }
            _ => {}
        }
        if ctx.is_computing(&input) {
            return Err(FusionError::Internal(format!("偵測到遞迴計算: {}", input)));
        }

        loop {
            if let Some(node) = self.inner.registry.get_consistent(&input) {
                if self.inner.register_read(ctx, &node) {
                    self.inner.renew_keep_alive(&node);
                    return Ok(node);
                }
                continue;
            }

            let lock = self.inner.locks.acquire(&input).await;
            if let Some(node) = self.inner.registry.get_consistent(&input) {
                drop(lock);
                if self.inner.register_read(ctx, &node) {
                    self.inner.renew_keep_alive(&node);
                    return Ok(node);
                }
                continue;
            }

            let node = Arc::new(Node::new(input.clone(), self.inner.versions.next(), options));
            self.inner.registry.insert(&node);
            tracing::debug!("計算節點: {} ({})", input, node.version());

            let mut guard = ComputingGuard {
                inner: &self.inner,
                node: Some(node.clone()),
            };
            let output = {
                let _scope = ctx.begin_compute(node.clone());
                evaluation.await
            };
            guard.disarm();
            self.inner.complete(&node, output);
            drop(lock);

            // 剛算完的節點已失效：不記錄指向它的邊，改讓呼叫者完成後失效
            if !self.inner.register_read(ctx, &node) {
                if let Some(parent) = ctx.current() {
                    self.inner.invalidate_node(&parent, true);
                }
            }
            return Ok(node);
        }
    }

    /// 在擷取範圍內執行 `producer`，回傳它直接讀取的節點
    pub async fn capture<T, F>(&self, ctx: &ComputeContext, producer: F) -> Result<Arc<Node>>
    where
        F: Future<Output = Result<T>>,
    {
        self.try_capture(ctx, producer)
            .await?
            .ok_or(FusionError::NothingCaptured)
    }

    /// 同 [`capture`](Self::capture)，沒有擷取到節點時回傳 `None`
    ///
    /// `producer` 失敗時，若擷取到的節點快取了錯誤則回傳該節點，否則傳遞錯誤。
    pub async fn try_capture<T, F>(&self, ctx: &ComputeContext, producer: F) -> Result<Option<Arc<Node>>>
    where
        F: Future<Output = Result<T>>,
    {
        let scope = ctx.begin_capture();
        let result = producer.await;
        let captured = scope.captured();
        drop(scope);
        Self::resolve_capture(result, captured)
    }

    /// 只擷取現成的節點，不會觸發計算
    pub async fn capture_existing<T, F>(&self, ctx: &ComputeContext, producer: F) -> Result<Option<Arc<Node>>>
    where
        F: Future<Output = Result<T>>,
    {
        let scope = ctx.begin_capture_existing();
        let result = producer.await;
        let captured = scope.captured();
        drop(scope);
        match result {
            Err(FusionError::NoExistingComputed(_)) => Ok(None),
            result => Self::resolve_capture(result, captured),
        }
    }

    fn resolve_capture<T>(result: Result<T>, captured: Option<Arc<Node>>) -> Result<Option<Arc<Node>>> {
        match result {
            Ok(_) => Ok(captured),
            Err(error) => match captured {
                Some(node) if node.has_error() => Ok(Some(node)),
                _ => Err(error),
            },
        }
    }

    /// 取得快取中一致的節點，不會觸發計算
    pub fn get_existing(&self, input: &ComputedInput) -> Result<Arc<Node>> {
        self.inner
            .registry
            .get_consistent(input)
            .ok_or_else(|| FusionError::NoExistingComputed(input.to_string()))
    }

    /// 使節點失效並傳播（遵循節點的失效延遲），回傳實際失效的節點數
    pub fn invalidate(&self, node: &Arc<Node>) -> usize {
        self.inner.invalidate_node(node, false)
    }

    /// 立即使節點失效並傳播，忽略失效延遲
    pub fn invalidate_now(&self, node: &Arc<Node>) -> usize {
        self.inner.invalidate_node(node, true)
    }

    /// 使輸入對應的節點失效，回傳是否找到節點
    pub fn invalidate_input(&self, input: &ComputedInput) -> bool {
        match self.inner.registry.get(input) {
            Some(node) => {
                self.inner.invalidate_node(&node, false);
                true
            }
            None => false,
        }
    }

    /// 在指定延遲後使節點失效
    pub fn invalidate_after(&self, node: &Arc<Node>, delay: Duration) {
        self.inner.invalidate_after(node, delay);
    }

    /// 修剪所有節點的過期反向邊
    pub fn prune(&self) -> usize {
        self.inner.prune_all()
    }

    /// 啟動週期性修剪任務
    pub fn spawn_pruning_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let graph = Arc::downgrade(&self.inner);
        let period = self.inner.config.prune_interval;
        let disposed = self.inner.cancel.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 第一個 tick 立即完成
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = disposed.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = graph.upgrade() else { break };
                        match tokio::task::spawn_blocking(move || inner.prune_all()).await {
                            Ok(removed) => tracing::debug!("週期修剪移除 {} 條反向邊", removed),
                            Err(e) => tracing::warn!("修剪任務失敗: {}", e),
                        }
                    }
                }
            }
            tracing::debug!("修剪任務已停止");
        })
    }

    /// 釋放計算圖：停止計時器與背景任務，清空登錄表
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        self.inner.timers.dispose();
        self.inner.registry.clear();
        tracing::info!("計算圖已釋放");
    }

    /// 存活節點數量
    pub fn node_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// 排程中的計時器數量
    pub fn timer_count(&self) -> usize {
        self.inner.timers.count()
    }
}

impl std::fmt::Debug for ComputedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedGraph")
            .field("nodes", &self.node_count())
            .field("timers", &self.timer_count())
            .finish()
    }
}
