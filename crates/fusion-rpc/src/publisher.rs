//! 伺服端計算發佈
//!
//! 把計算方法註冊成 RPC 方法：每次呼入都在伺服端計算圖內擷取產生的節點，
//! 並訂閱它的失效，失效時推送通知給呼叫端。
//!
//! 訂閱以 (呼叫端, 快取鍵) 為單位，持有節點的強參照直到節點失效，
//! 所以保持存活計時到期後節點仍留在計算圖中，寫入時找得到它。

use std::future::Future;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fusion_core::{ArgumentList, FusionError, Result};
use fusion_graph::{ComputeContext, ComputedGraph, Node};
use serde::Serialize;
use uuid::Uuid;

use crate::cache_key::RpcCacheKey;
use crate::hub::RpcHub;
use crate::services::{RpcInboundContext, RpcInvoker, RpcMethodDef};
use crate::transport::RpcInvalidationNotice;

type Subscriptions = DashMap<(Uuid, RpcCacheKey), Arc<Node>>;

pub struct RpcComputedPublisher {
    hub: Weak<RpcHub>,
    graph: ComputedGraph,
    subscriptions: Arc<Subscriptions>,
}

impl RpcComputedPublisher {
    pub fn new(hub: &Arc<RpcHub>, graph: ComputedGraph) -> Self {
        Self {
            hub: Arc::downgrade(hub),
            graph,
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    pub fn graph(&self) -> &ComputedGraph {
        &self.graph
    }

    /// 仍有效的訂閱數
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// 移除對端的全部訂閱（對端斷線時）
    pub fn unsubscribe_peer(&self, caller: Uuid) -> usize {
        unsubscribe_peer(&self.subscriptions, caller)
    }

    /// 發佈計算方法
    ///
    /// `compute` 必須透過傳入的 `ComputeContext` 讀取計算圖，直接讀到的節點就是回應的來源。
    pub fn publish<T, F, Fut>(&self, service: &str, method: &str, compute: F) -> Result<()>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: Fn(Arc<ComputeContext>, ArgumentList) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(hub) = self.hub.upgrade() else {
            return Err(FusionError::Disposed("RPC hub 已釋放".to_string()));
        };

        let compute = Arc::new(compute);
        let graph = self.graph.clone();
        let weak_hub = self.hub.clone();
        let subscriptions = self.subscriptions.clone();
        let invoker: RpcInvoker = Arc::new(move |inbound: RpcInboundContext, arguments: ArgumentList| {
            let compute = compute.clone();
            let graph = graph.clone();
            let hub = weak_hub.clone();
            let subscriptions = subscriptions.clone();
            Box::pin(async move {
                let key = RpcCacheKey::new(&inbound.method, &arguments)?;
                let ctx = Arc::new(ComputeContext::new());
                let node = graph.capture(&ctx, compute(ctx.clone(), arguments)).await?;
                subscribe(&subscriptions, &node, hub, inbound.caller, key);

                let value: T = node.value()?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            })
        });

        hub.services().register(RpcMethodDef::new(service, method), invoker)
    }
}

fn unsubscribe_peer(subscriptions: &Subscriptions, caller: Uuid) -> usize {
    let before = subscriptions.len();
    subscriptions.retain(|(peer, _), _| *peer != caller);
    before - subscriptions.len()
}

/// 訂閱節點失效；同一 (呼叫端, 快取鍵) 對同一節點只註冊一次
fn subscribe(subscriptions: &Arc<Subscriptions>, node: &Arc<Node>, hub: Weak<RpcHub>, caller: Uuid, key: RpcCacheKey) {
    let fresh = match subscriptions.entry((caller, key.clone())) {
        Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), node) => false,
        Entry::Occupied(mut entry) => {
            entry.insert(node.clone());
            true
        }
        Entry::Vacant(entry) => {
            entry.insert(node.clone());
            true
        }
    };
    if !fresh {
        return;
    }

    let registry = Arc::downgrade(subscriptions);
    node.on_invalidated(move |invalidated| {
        let registry = registry.upgrade();
        let subscription = (caller, key);
        if let Some(registry) = &registry {
            registry.remove_if(&subscription, |_, held| std::ptr::eq(Arc::as_ptr(held), invalidated));
        }
        let Some(hub) = hub.upgrade() else {
            return;
        };

        let (caller, key) = subscription;
        tracing::debug!("推送失效通知 {} → {}", invalidated.input(), caller);
        if !hub.notify_peer(caller, RpcInvalidationNotice { key }) {
            let dropped = registry.map_or(0, |registry| unsubscribe_peer(&registry, caller));
            tracing::debug!("對端 {} 已不存在，移除 {} 個訂閱", caller, dropped);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::peer::{FixedRouter, RpcPeerRef};
    use crate::transport::LoopbackTransport;
    use fusion_core::{ComputedInput, FusionConfig};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    type TodoStore = Arc<Mutex<HashMap<String, String>>>;

    struct Fixture {
        server: Arc<RpcHub>,
        client: RpcHub,
        publisher: RpcComputedPublisher,
        graph: ComputedGraph,
        store: TodoStore,
        _transport: Arc<LoopbackTransport>,
    }

    fn todo_args(id: &str) -> ArgumentList {
        ArgumentList::new().with(id).unwrap()
    }

    fn todo_input(id: &str) -> ComputedInput {
        ComputedInput::new("todo", "get", &todo_args(id)).unwrap()
    }

    fn setup() -> Fixture {
        let transport = Arc::new(LoopbackTransport::new());
        let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        let graph = ComputedGraph::new(FusionConfig::new());
        let store: TodoStore = Arc::new(Mutex::new(HashMap::from([("1".to_string(), "買牛奶".to_string())])));

        let publisher = RpcComputedPublisher::new(&server, graph.clone());
        {
            let graph = graph.clone();
            let store = store.clone();
            publisher
                .publish("todo", "get", move |ctx, args| {
                    let graph = graph.clone();
                    let store = store.clone();
                    async move {
                        let id: String = args.get(0)?;
                        graph
                            .compute(&ctx, todo_input(&id), async move {
                                Ok(store.lock().get(&id).cloned().unwrap_or_default())
                            })
                            .await
                    }
                })
                .unwrap();
        }
        transport.attach("server", &server);

        let client = RpcHub::new(RpcConfig::new(), transport.clone())
            .with_router(FixedRouter(RpcPeerRef::remote("server")));
        Fixture {
            server,
            client,
            publisher,
            graph,
            store,
            _transport: transport,
        }
    }

    async fn get(client: &RpcHub) -> String {
        client.call_typed("todo", "get", todo_args("1")).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribed_node_outlives_keep_alive() {
        let fixture = setup();
        let mut notices = fixture.client.take_notice_receiver().unwrap();
        assert_eq!(get(&fixture.client).await, "買牛奶");

        // 保持存活計時早已到期
        tokio::time::sleep(Duration::from_secs(61)).await;

        fixture.store.lock().insert("1".to_string(), "買咖啡".to_string());
        assert!(fixture.graph.invalidate_input(&todo_input("1")));

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.key.to_input(), todo_input("1"));
        assert_eq!(fixture.publisher.subscription_count(), 0);
        assert_eq!(get(&fixture.client).await, "買咖啡");
    }

    #[tokio::test]
    async fn test_one_notice_per_invalidation() {
        let fixture = setup();
        let mut notices = fixture.client.take_notice_receiver().unwrap();
        for _ in 0..5 {
            assert_eq!(get(&fixture.client).await, "買牛奶");
        }
        assert_eq!(fixture.publisher.subscription_count(), 1);

        assert!(fixture.graph.invalidate_input(&todo_input("1")));

        assert!(notices.try_recv().is_ok());
        assert!(notices.try_recv().is_err());
        assert_eq!(fixture.publisher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_new_node_gets_new_subscription() {
        let fixture = setup();
        let mut notices = fixture.client.take_notice_receiver().unwrap();

        get(&fixture.client).await;
        fixture.graph.invalidate_input(&todo_input("1"));
        get(&fixture.client).await;
        assert_eq!(fixture.publisher.subscription_count(), 1);

        fixture.graph.invalidate_input(&todo_input("1"));
        assert!(notices.try_recv().is_ok());
        assert!(notices.try_recv().is_ok());
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_peer_releases_nodes() {
        let fixture = setup();
        get(&fixture.client).await;
        assert_eq!(fixture.server.inbound_peer_count(), 1);

        assert_eq!(fixture.publisher.unsubscribe_peer(fixture.client.id()), 1);
        assert_eq!(fixture.publisher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_gone_peer_drops_its_subscriptions() {
        let fixture = setup();
        get(&fixture.client).await;
        let missing = fixture
            .client
            .call_typed::<String>("todo", "get", todo_args("2"))
            .await
            .unwrap();
        assert_eq!(missing, "");
        assert_eq!(fixture.publisher.subscription_count(), 2);

        // 用戶端丟棄通知接收端後，第一次推送失敗就移除它的全部訂閱
        drop(fixture.client.take_notice_receiver());
        fixture.graph.invalidate_input(&todo_input("1"));
        assert_eq!(fixture.publisher.subscription_count(), 0);
    }
}
