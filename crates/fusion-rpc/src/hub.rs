//! RPC 樞紐
//!
//! 一個 hub 同時扮演客戶端與伺服端：
//! 呼出時依路由選擇對端、握手並處理重新路由與取消；
//! 呼入時把訊息交給服務登錄表，並記住呼叫端以便推送失效通知。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use fusion_core::{ArgumentList, FusionError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::handshake::RpcHandshake;
use crate::outbound::{RpcCallState, RpcOutboundCall, RpcOutboundContext};
use crate::peer::{FixedRouter, RpcCallRouter, RpcPeer, RpcPeerRef};
use crate::services::{RpcInboundContext, RpcMethodDef, RpcServiceRegistry};
use crate::transport::{NoticeSender, RpcInvalidationNotice, RpcMessage, RpcTransport};

/// 已握手的呼入對端
struct InboundPeer {
    handshake: RpcHandshake,
    notices: NoticeSender,
}

pub struct RpcHub {
    id: Uuid,
    config: RpcConfig,
    services: RpcServiceRegistry,
    router: Box<dyn RpcCallRouter>,
    transport: Arc<dyn RpcTransport>,
    peers: DashMap<String, Arc<RpcPeer>>,
    inbound_peers: DashMap<Uuid, InboundPeer>,
    notice_tx: NoticeSender,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<RpcInvalidationNotice>>>,
    next_call_id: AtomicU64,
}

impl RpcHub {
    /// 創建 hub，預設路由為本機
    pub fn new(config: RpcConfig, transport: Arc<dyn RpcTransport>) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            config,
            services: RpcServiceRegistry::new(),
            router: Box::new(FixedRouter(RpcPeerRef::Local)),
            transport,
            peers: DashMap::new(),
            inbound_peers: DashMap::new(),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            next_call_id: AtomicU64::new(1),
        }
    }

    /// 建構器模式：設置呼叫路由
    pub fn with_router(mut self, router: impl RpcCallRouter + 'static) -> Self {
        self.router = Box::new(router);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn services(&self) -> &RpcServiceRegistry {
        &self.services
    }

    /// 取走失效通知接收端（只能取一次）
    pub fn take_notice_receiver(&self) -> Option<mpsc::UnboundedReceiver<RpcInvalidationNotice>> {
        self.notice_rx.lock().take()
    }

    /// 本端握手訊息
    pub fn local_handshake(&self) -> RpcHandshake {
        RpcHandshake::new(self.id, Some(self.config.local_versions.clone()))
    }

    /// 伺服端：接受對端握手
    pub fn accept_handshake(&self, remote: RpcHandshake, notices: NoticeSender) -> Result<RpcHandshake> {
        if let Err(e) = remote.verify(&self.config.required_versions) {
            tracing::warn!("拒絕對端 {}: {}", remote.remote_peer_id, e);
            return Err(e);
        }
        tracing::info!("接受對端握手: {}", remote.remote_peer_id);
        self.inbound_peers.insert(
            remote.remote_peer_id,
            InboundPeer {
                handshake: remote,
                notices,
            },
        );
        Ok(self.local_handshake())
    }

    /// 已握手的呼入對端數量
    pub fn inbound_peer_count(&self) -> usize {
        self.inbound_peers.len()
    }

    /// 呼入對端的握手資訊
    pub fn inbound_handshake(&self, peer: &Uuid) -> Option<RpcHandshake> {
        self.inbound_peers.get(peer).map(|p| p.handshake.clone())
    }

    /// 伺服端：處理呼入呼叫
    pub async fn handle_call(&self, caller: Uuid, message: RpcMessage) -> Result<Bytes> {
        let invoker = self.services.get(&message.method)?;
        let arguments = ArgumentList::from_bytes(&message.argument_data)?;
        tracing::debug!("處理呼入呼叫 #{}: {}", message.call_id, message.method);
        let inbound = RpcInboundContext {
            caller,
            method: message.method,
        };
        invoker(inbound, arguments).await
    }

    /// 推送失效通知給對端；本端呼叫的通知送往自己的接收端
    pub fn notify_peer(&self, peer: Uuid, notice: RpcInvalidationNotice) -> bool {
        if peer == self.id {
            return self.notice_tx.send(notice).is_ok();
        }
        let Some(sender) = self.inbound_peers.get(&peer).map(|p| p.notices.clone()) else {
            return false;
        };
        if sender.send(notice).is_err() {
            tracing::debug!("對端已斷線，移除: {}", peer);
            self.inbound_peers.remove(&peer);
            return false;
        }
        true
    }

    fn peer(&self, name: &str) -> Arc<RpcPeer> {
        self.peers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RpcPeer::new(name)))
            .clone()
    }

    /// 確保已與對端握手；失敗時下次呼叫會重新握手
    pub async fn ensure_handshake(&self, name: &str) -> Result<RpcHandshake> {
        let peer = self.peer(name);
        let transport = self.transport.clone();
        let local = self.local_handshake();
        let notices = self.notice_tx.clone();
        let required = self.config.required_versions.clone();
        let handshake = peer
            .handshake_cell()
            .get_or_try_init(move || async move {
                let remote = transport.handshake(name, local, notices).await?;
                remote.verify(&required)?;
                tracing::info!("與對端 {} 握手完成: {}", name, remote.remote_peer_id);
                Ok::<_, FusionError>(remote)
            })
            .await?;
        Ok(handshake.clone())
    }

    /// 執行呼出呼叫
    pub async fn call(&self, ctx: &mut RpcOutboundContext) -> Result<Bytes> {
        ctx.must_capture_cache_key()?;
        let peer = ctx.prepare_call(self.router.as_ref())?;
        let mut call = RpcOutboundCall::new(self.next_call_id.fetch_add(1, Ordering::Relaxed), peer);
        let cancel = ctx.cancellation().clone();

        loop {
            let result = match call.peer.clone() {
                RpcPeerRef::Local => {
                    call.transition(RpcCallState::Local)?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.invoke_local(ctx) => Some(result),
                    }
                }
                RpcPeerRef::Remote(name) => {
                    call.transition(RpcCallState::Dispatched)?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.dispatch(&name, call.id, ctx) => Some(result),
                    }
                }
            };

            let error = match result {
                None => {
                    tracing::debug!("呼叫 #{} 已取消: {}", call.id, ctx.method);
                    call.transition(RpcCallState::Cancelled)?;
                    return Err(FusionError::Cancelled);
                }
                Some(Ok(data)) => {
                    call.transition(RpcCallState::Completed)?;
                    ctx.capture_response(&data);
                    return Ok(data);
                }
                Some(Err(error)) => error,
            };

            let reroute = call.state() == RpcCallState::Dispatched
                && (matches!(error, FusionError::Reroute(_)) || ctx.is_peer_changed(self.router.as_ref()));
            if !reroute || ctx.reroute_count() >= self.config.max_reroutes {
                call.transition(RpcCallState::Failed)?;
                return Err(error);
            }

            let peer = match ctx.prepare_reroute(self.router.as_ref()) {
                Ok(peer) => peer,
                Err(e) => {
                    call.transition(RpcCallState::Failed)?;
                    return Err(e);
                }
            };
            tracing::warn!(
                "呼叫 #{} 重新路由 {} → {} ({})",
                call.id,
                call.peer,
                peer,
                error
            );
            call.reroute_to(peer)?;
        }
    }

    /// 呼叫並以 JSON 解碼結果
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        arguments: ArgumentList,
    ) -> Result<T> {
        let mut ctx = RpcOutboundContext::new(RpcMethodDef::new(service, method), arguments);
        let data = self.call(&mut ctx).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn invoke_local(&self, ctx: &RpcOutboundContext) -> Result<Bytes> {
        let invoker = self.services.get(&ctx.method)?;
        let inbound = RpcInboundContext {
            caller: self.id,
            method: ctx.method.clone(),
        };
        invoker(inbound, ctx.arguments.clone()).await
    }

    async fn dispatch(&self, peer: &str, call_id: u64, ctx: &RpcOutboundContext) -> Result<Bytes> {
        self.ensure_handshake(peer).await?;
        let message = RpcMessage {
            call_id,
            method: ctx.method.clone(),
            argument_data: ctx.arguments.to_bytes()?,
        };
        self.transport.call(peer, self.id, message).await
    }
}

impl std::fmt::Debug for RpcHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHub")
            .field("id", &self.id)
            .field("services", &self.services.len())
            .field("peers", &self.peers.len())
            .field("inbound_peers", &self.inbound_peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use fusion_core::VersionSet;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn add_service(hub: &RpcHub, offset: i64) {
        hub.services()
            .register_fn("math", "add", move |_, args: ArgumentList| async move {
                Ok(args.get::<i64>(0)? + args.get::<i64>(1)? + offset)
            })
            .unwrap();
    }

    fn args(a: i64, b: i64) -> ArgumentList {
        ArgumentList::new().with(a).unwrap().with(b).unwrap()
    }

    #[tokio::test]
    async fn test_local_call_short_circuits() {
        let transport = Arc::new(LoopbackTransport::new());
        let hub = RpcHub::new(RpcConfig::new(), transport);
        add_service(&hub, 0);

        let sum: i64 = hub.call_typed("math", "add", args(1, 2)).await.unwrap();
        assert_eq!(sum, 3);
        assert!(hub.peers.is_empty());
    }

    #[tokio::test]
    async fn test_remote_call_over_loopback() {
        let transport = Arc::new(LoopbackTransport::new());
        let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        add_service(&server, 0);
        transport.attach("server", &server);

        let client = RpcHub::new(RpcConfig::new(), transport.clone())
            .with_router(FixedRouter(RpcPeerRef::remote("server")));

        let sum: i64 = client.call_typed("math", "add", args(20, 22)).await.unwrap();
        assert_eq!(sum, 42);
        assert_eq!(server.inbound_peer_count(), 1);
        assert!(server.inbound_handshake(&client.id()).is_some());

        let handshake = client.ensure_handshake("server").await.unwrap();
        assert_eq!(handshake.remote_peer_id, server.id());
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let transport = Arc::new(LoopbackTransport::new());
        let server_config = RpcConfig::new().with_local_versions(VersionSet::parse("api=1.0").unwrap());
        let server = Arc::new(RpcHub::new(server_config, transport.clone()));
        add_service(&server, 0);
        transport.attach("server", &server);

        let client_config = RpcConfig::new().with_required_versions(VersionSet::parse("api=2.0").unwrap());
        let client = RpcHub::new(client_config, transport.clone())
            .with_router(FixedRouter(RpcPeerRef::remote("server")));

        let result: Result<i64> = client.call_typed("math", "add", args(1, 1)).await;
        assert!(matches!(result, Err(FusionError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_pinned_call_reroute_is_internal_error() {
        let transport = Arc::new(LoopbackTransport::new());
        let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        server
            .services()
            .register_fn("math", "add", |_, _| async {
                Err::<i64, _>(FusionError::Reroute("分片已搬移".to_string()))
            })
            .unwrap();
        transport.attach("a", &server);

        let client = RpcHub::new(RpcConfig::new(), transport.clone());
        let mut ctx = RpcOutboundContext::new(RpcMethodDef::new("math", "add"), args(1, 2))
            .with_peer(RpcPeerRef::remote("a"));

        let result = client.call(&mut ctx).await;
        assert!(matches!(result, Err(FusionError::Internal(_))));
    }

    #[tokio::test]
    async fn test_reroute_to_moved_peer() {
        let transport = Arc::new(LoopbackTransport::new());
        let target = Arc::new(Mutex::new("a".to_string()));

        let moving = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        let moved_to = target.clone();
        moving
            .services()
            .register_fn("math", "add", move |_, _| {
                *moved_to.lock() = "b".to_string();
                async { Err::<i64, _>(FusionError::Reroute("分片已搬移".to_string())) }
            })
            .unwrap();
        let stable = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        add_service(&stable, 100);
        transport.attach("a", &moving);
        transport.attach("b", &stable);

        let route = target.clone();
        let client = RpcHub::new(RpcConfig::new(), transport.clone()).with_router(
            move |_: &RpcMethodDef, _: &ArgumentList| -> Result<RpcPeerRef> {
                Ok(RpcPeerRef::remote(&route.lock()))
            },
        );

        let mut ctx = RpcOutboundContext::new(RpcMethodDef::new("math", "add"), args(1, 2));
        let data = client.call(&mut ctx).await.unwrap();
        assert_eq!(serde_json::from_slice::<i64>(&data).unwrap(), 103);
        assert_eq!(ctx.reroute_count(), 1);
        assert_eq!(ctx.peer(), Some(&RpcPeerRef::remote("b")));
    }

    #[tokio::test]
    async fn test_reroutes_are_bounded() {
        let transport = Arc::new(LoopbackTransport::new());
        let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        server
            .services()
            .register_fn("math", "add", |_, _| async {
                Err::<i64, _>(FusionError::Reroute("一直搬移".to_string()))
            })
            .unwrap();
        transport.attach("a", &server);

        let client = RpcHub::new(RpcConfig::new().with_max_reroutes(2), transport.clone())
            .with_router(FixedRouter(RpcPeerRef::remote("a")));
        let mut ctx = RpcOutboundContext::new(RpcMethodDef::new("math", "add"), args(1, 2));

        let result = client.call(&mut ctx).await;
        assert!(matches!(result, Err(FusionError::Reroute(_))));
        assert_eq!(ctx.reroute_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_without_reroute() {
        let transport = Arc::new(LoopbackTransport::new());
        let client = RpcHub::new(RpcConfig::new(), transport)
            .with_router(FixedRouter(RpcPeerRef::remote("missing")));

        let result: Result<i64> = client.call_typed("math", "add", args(1, 2)).await;
        assert!(matches!(result, Err(FusionError::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_tears_down_call() {
        let transport = Arc::new(LoopbackTransport::new());
        let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
        server
            .services()
            .register_fn("math", "slow", |_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(0)
            })
            .unwrap();
        transport.attach("server", &server);

        let client = RpcHub::new(RpcConfig::new(), transport.clone())
            .with_router(FixedRouter(RpcPeerRef::remote("server")));
        let cancel = CancellationToken::new();
        let mut ctx = RpcOutboundContext::new(RpcMethodDef::new("math", "slow"), ArgumentList::new())
            .with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = client.call(&mut ctx).await;
        assert!(matches!(result, Err(FusionError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_local_notice_goes_to_own_receiver() {
        let hub = RpcHub::new(RpcConfig::new(), Arc::new(LoopbackTransport::new()));
        let mut receiver = hub.take_notice_receiver().unwrap();
        assert!(hub.take_notice_receiver().is_none());

        let key = crate::cache_key::RpcCacheKey::new(&RpcMethodDef::new("todo", "get"), &ArgumentList::new()).unwrap();
        assert!(hub.notify_peer(hub.id(), RpcInvalidationNotice { key: key.clone() }));
        assert!(!hub.notify_peer(Uuid::new_v4(), RpcInvalidationNotice { key: key.clone() }));
        assert_eq!(receiver.recv().await.unwrap().key, key);
    }
}
