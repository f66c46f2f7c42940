//! 遠端計算客戶端
//!
//! 在本地計算圖內執行遠端呼叫：每個 [`RpcCacheKey`] 對應一個本地節點，
//! 伺服端推送失效通知時使該節點失效，讀取它的本地計算隨之失效。

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use fusion_core::{ArgumentList, FusionError, Result, TransiencyResolver};
use fusion_graph::{ComputeContext, ComputedGraph, ComputedValue, Node};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache_key::{RpcCacheInfoCapture, RpcCacheInfoCaptureMode, RpcCacheKey};
use crate::client_cache::ClientComputedCache;
use crate::config::RemoteCacheMode;
use crate::hub::RpcHub;
use crate::outbound::RpcOutboundContext;
use crate::services::RpcMethodDef;
use crate::transport::RpcInvalidationNotice;

type NodeIndex = DashMap<RpcCacheKey, Weak<Node>>;

pub struct RemoteComputeClient {
    hub: Arc<RpcHub>,
    graph: ComputedGraph,
    cache: Option<Arc<dyn ClientComputedCache>>,
    mode: RemoteCacheMode,
    resolver: TransiencyResolver,
    nodes: Arc<NodeIndex>,
}

impl RemoteComputeClient {
    pub fn new(hub: Arc<RpcHub>, graph: ComputedGraph) -> Self {
        let mode = hub.config().remote_cache_mode;
        Self {
            hub,
            graph,
            cache: None,
            mode,
            resolver: TransiencyResolver::default(),
            nodes: Arc::new(DashMap::new()),
        }
    }

    /// 建構器模式：設置客戶端快取
    pub fn with_cache(mut self, cache: Arc<dyn ClientComputedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 建構器模式：設置快取模式
    pub fn with_mode(mut self, mode: RemoteCacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// 建構器模式：設置暫時性錯誤判定
    pub fn with_resolver(mut self, resolver: TransiencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn graph(&self) -> &ComputedGraph {
        &self.graph
    }

    /// 追蹤中的遠端節點數量
    pub fn tracked_count(&self) -> usize {
        self.nodes.len()
    }

    /// 在計算圖內呼叫遠端方法
    ///
    /// 透過 `ctx` 讀取，所以呼叫者會相依於回傳的遠端節點。
    pub async fn call<T>(&self, ctx: &ComputeContext, service: &str, method: &str, arguments: ArgumentList) -> Result<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let method = RpcMethodDef::new(service, method);
        let key = RpcCacheKey::new(&method, &arguments)?;
        let options = self.graph.config().default_options.clone();
        let evaluation = async {
            self.fetch::<T>(ctx, &key, method, arguments)
                .await
                .map(|value| Arc::new(value) as ComputedValue)
        };
        let node = self.graph.compute_node(ctx, key.to_input(), options, evaluation).await?;
        node.value::<T>()
    }

    async fn fetch<T>(&self, ctx: &ComputeContext, key: &RpcCacheKey, method: RpcMethodDef, arguments: ArgumentList) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let node = ctx.current();
        if let Some(node) = &node {
            self.track(key, node);
        }
        let cached = self.cache.as_ref().and_then(|cache| cache.get(key));

        if self.mode == RemoteCacheMode::CacheFirst {
            if let Some(data) = &cached {
                match serde_json::from_slice::<T>(data) {
                    Ok(value) => {
                        tracing::debug!("使用本地快取並背景更新: {}", key);
                        self.spawn_refresh(key.clone(), method, arguments, data.clone(), node);
                        return Ok(value);
                    }
                    Err(e) => tracing::warn!("本地快取無法解碼 {}: {}", key, e),
                }
            }
        }

        let mut call = RpcOutboundContext::new(method, arguments)
            .with_cache_info_capture(RpcCacheInfoCaptureMode::KeyAndData);
        match self.hub.call(&mut call).await {
            Ok(data) => {
                self.store(call.take_cache_info_capture());
                Ok(serde_json::from_slice(&data)?)
            }
            Err(error) if self.resolver.resolve(&error).is_transient() => {
                let Some(data) = cached else {
                    return Err(error);
                };
                tracing::warn!("遠端呼叫失敗，改用本地快取 {}: {}", key, error);
                // 沒有伺服端訂閱，稍後重新呼叫
                if let Some(node) = &node {
                    let delay = node.options().transient_error_invalidation_delay;
                    self.graph.invalidate_after(node, delay);
                }
                Ok(serde_json::from_slice(&data)?)
            }
            Err(error) => Err(error),
        }
    }

    fn store(&self, capture: Option<RpcCacheInfoCapture>) {
        let (Some(cache), Some(capture)) = (&self.cache, capture) else {
            return;
        };
        if let (Some(key), Some(data)) = (capture.key, capture.data) {
            cache.set(key, data);
        }
    }

    fn track(&self, key: &RpcCacheKey, node: &Arc<Node>) {
        self.nodes.insert(key.clone(), Arc::downgrade(node));

        let index = Arc::downgrade(&self.nodes);
        let key = key.clone();
        node.on_invalidated(move |invalidated| {
            if let Some(index) = index.upgrade() {
                index.remove_if(&key, |_, tracked| std::ptr::eq(tracked.as_ptr(), invalidated));
            }
        });
    }

    fn spawn_refresh(
        &self,
        key: RpcCacheKey,
        method: RpcMethodDef,
        arguments: ArgumentList,
        cached: Bytes,
        node: Option<Arc<Node>>,
    ) {
        let hub = self.hub.clone();
        let cache = self.cache.clone();
        let graph = self.graph.clone();
        let node = node.map(|node| Arc::downgrade(&node));

        tokio::spawn(async move {
            let mut call = RpcOutboundContext::new(method, arguments);
            match hub.call(&mut call).await {
                Ok(data) => {
                    if let Some(cache) = &cache {
                        cache.set(key.clone(), data.clone());
                    }
                    if data != cached {
                        if let Some(node) = node.and_then(|node| node.upgrade()) {
                            tracing::debug!("背景更新結果不同，使節點失效: {}", key);
                            graph.invalidate(&node);
                        }
                    }
                }
                Err(e) => tracing::warn!("背景更新失敗 {}: {}", key, e),
            }
        });
    }

    /// 套用伺服端的失效通知，回傳是否有本地節點失效
    pub fn on_invalidation_notice(&self, notice: &RpcInvalidationNotice) -> bool {
        if let Some(cache) = &self.cache {
            cache.remove(notice.key.clone());
        }
        let node = self.nodes.get(&notice.key).and_then(|tracked| tracked.upgrade());
        match node {
            Some(node) => {
                tracing::debug!("收到失效通知: {}", notice.key);
                self.graph.invalidate(&node);
                true
            }
            None => false,
        }
    }

    /// 啟動失效通知監聽任務
    pub fn spawn_notice_listener(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut receiver = self
            .hub
            .take_notice_receiver()
            .ok_or_else(|| FusionError::Internal("失效通知接收端已被取用".to_string()))?;
        let client = Arc::downgrade(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    notice = receiver.recv() => {
                        let (Some(notice), Some(client)) = (notice, client.upgrade()) else {
                            break;
                        };
                        client.on_invalidation_notice(&notice);
                    }
                }
            }
            tracing::debug!("失效通知監聽已停止");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_cache::FlushingClientComputedCache;
    use crate::config::RpcConfig;
    use crate::peer::{FixedRouter, RpcPeerRef};
    use crate::publisher::RpcComputedPublisher;
    use crate::transport::LoopbackTransport;
    use fusion_core::{ComputedInput, FusionConfig};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    type TodoStore = Arc<Mutex<HashMap<String, String>>>;

    struct Fixture {
        transport: Arc<LoopbackTransport>,
        server_graph: ComputedGraph,
        store: TodoStore,
        client: Arc<RemoteComputeClient>,
        cache: Arc<FlushingClientComputedCache>,
        _server: Arc<RpcHub>,
    }

    fn todo_args(id: &str) -> ArgumentList {
        ArgumentList::new().with(id).unwrap()
    }

    fn setup(mode: RemoteCacheMode) -> Fixture {
        let transport = Arc::new(LoopbackTransport::new());
        let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        let server_graph = ComputedGraph::new(FusionConfig::new());
        let store: TodoStore = Arc::new(Mutex::new(HashMap::new()));
        store.lock().insert("1".to_string(), "買牛奶".to_string());

        let publisher = RpcComputedPublisher::new(&server, server_graph.clone());
        let graph = server_graph.clone();
        let todos = store.clone();
        publisher
            .publish("todo", "get", move |ctx, args| {
                let graph = graph.clone();
                let todos = todos.clone();
                async move {
                    let id: String = args.get(0)?;
                    let input = ComputedInput::new("todo", "get", &args)?;
                    graph
                        .compute(&ctx, input, async move {
                            Ok(todos.lock().get(&id).cloned().unwrap_or_default())
                        })
                        .await
                }
            })
            .unwrap();
        transport.attach("server", &server);

        let client_hub = Arc::new(
            RpcHub::new(RpcConfig::new(), transport.clone()).with_router(FixedRouter(RpcPeerRef::remote("server"))),
        );
        let cache = Arc::new(FlushingClientComputedCache::in_memory(Duration::from_millis(50)));
        let client = Arc::new(
            RemoteComputeClient::new(client_hub, ComputedGraph::new(FusionConfig::new()))
                .with_cache(cache.clone())
                .with_mode(mode),
        );

        Fixture {
            transport,
            server_graph,
            store,
            client,
            cache,
            _server: server,
        }
    }

    async fn title(client: &RemoteComputeClient, ctx: &ComputeContext) -> Result<String> {
        let input = ComputedInput::new("ui", "title", &ArgumentList::new())?;
        client
            .graph()
            .compute(ctx, input, async {
                let todo: String = client.call(ctx, "todo", "get", todo_args("1")).await?;
                Ok(format!("[{}]", todo))
            })
            .await
    }

    fn title_input() -> ComputedInput {
        ComputedInput::new("ui", "title", &ArgumentList::new()).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("條件未在時限內成立");
    }

    #[tokio::test]
    async fn test_server_invalidation_reaches_client_dependents() {
        let fixture = setup(RemoteCacheMode::NetworkFirst);
        let cancel = CancellationToken::new();
        fixture.client.spawn_notice_listener(cancel.clone()).unwrap();

        let ctx = ComputeContext::new();
        assert_eq!(title(&fixture.client, &ctx).await.unwrap(), "[買牛奶]");
        assert_eq!(fixture.client.tracked_count(), 1);

        // 伺服端寫入後使讀取失效
        fixture.store.lock().insert("1".to_string(), "買咖啡".to_string());
        let server_input = ComputedInput::new("todo", "get", &todo_args("1")).unwrap();
        assert!(fixture.server_graph.invalidate_input(&server_input));

        let client_graph = fixture.client.graph().clone();
        wait_until(|| client_graph.get_existing(&title_input()).is_err()).await;
        assert_eq!(fixture.client.tracked_count(), 0);

        assert_eq!(title(&fixture.client, &ctx).await.unwrap(), "[買咖啡]");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache_when_offline() {
        let fixture = setup(RemoteCacheMode::NetworkFirst);
        let ctx = ComputeContext::new();
        assert_eq!(title(&fixture.client, &ctx).await.unwrap(), "[買牛奶]");

        fixture.transport.detach("server");
        let key = RpcCacheKey::new(&RpcMethodDef::new("todo", "get"), &todo_args("1")).unwrap();
        let client_graph = fixture.client.graph();
        assert!(client_graph.invalidate_input(&key.to_input()));

        // 離線時使用最後已知的值
        assert_eq!(title(&fixture.client, &ctx).await.unwrap(), "[買牛奶]");

        fixture.cache.clear();
        client_graph.invalidate_input(&key.to_input());
        let result = title(&fixture.client, &ctx).await;
        assert!(matches!(result, Err(FusionError::Transient(_))));
    }

    #[tokio::test]
    async fn test_cache_first_returns_cached_then_refreshes() {
        let fixture = setup(RemoteCacheMode::CacheFirst);
        let key = RpcCacheKey::new(&RpcMethodDef::new("todo", "get"), &todo_args("1")).unwrap();
        fixture
            .cache
            .set(key.clone(), Bytes::from(serde_json::to_vec("舊的待辦").unwrap()));

        let ctx = ComputeContext::new();
        assert_eq!(title(&fixture.client, &ctx).await.unwrap(), "[舊的待辦]");

        // 背景更新取得不同的值後使節點失效
        let client_graph = fixture.client.graph().clone();
        wait_until(|| client_graph.get_existing(&title_input()).is_err()).await;
        assert_eq!(title(&fixture.client, &ctx).await.unwrap(), "[買牛奶]");
    }

    #[tokio::test]
    async fn test_notice_for_unknown_key_is_ignored() {
        let fixture = setup(RemoteCacheMode::NetworkFirst);
        let key = RpcCacheKey::new(&RpcMethodDef::new("todo", "get"), &todo_args("404")).unwrap();
        assert!(!fixture.client.on_invalidation_notice(&RpcInvalidationNotice { key }));
    }

    #[tokio::test]
    async fn test_listener_requires_receiver() {
        let fixture = setup(RemoteCacheMode::NetworkFirst);
        let cancel = CancellationToken::new();
        let handle = fixture.client.spawn_notice_listener(cancel.clone()).unwrap();
        assert!(fixture.client.spawn_notice_listener(cancel.clone()).is_err());

        cancel.cancel();
        handle.await.unwrap();
    }
}
