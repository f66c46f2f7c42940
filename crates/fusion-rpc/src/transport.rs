//! 傳輸層
//!
//! [`RpcTransport`] 只負責把握手與呼叫送到具名對端；
//! [`LoopbackTransport`] 在同一行程內把多個 [`RpcHub`] 接起來。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fusion_core::{FusionError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache_key::RpcCacheKey;
use crate::handshake::RpcHandshake;
use crate::hub::RpcHub;
use crate::services::RpcMethodDef;

/// 呼叫訊息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub call_id: u64,
    pub method: RpcMethodDef,
    pub argument_data: Bytes,
}

/// 伺服端推送的失效通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcInvalidationNotice {
    pub key: RpcCacheKey,
}

/// 失效通知的發送端
pub type NoticeSender = mpsc::UnboundedSender<RpcInvalidationNotice>;

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// 與對端握手；`notices` 是對端推送失效通知的通道
    async fn handshake(&self, peer: &str, local: RpcHandshake, notices: NoticeSender) -> Result<RpcHandshake>;

    /// 送出呼叫並等待回應
    async fn call(&self, peer: &str, caller: Uuid, message: RpcMessage) -> Result<Bytes>;
}

/// 行程內傳輸
#[derive(Default)]
pub struct LoopbackTransport {
    hubs: DashMap<String, Weak<RpcHub>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以名稱掛上一個 hub
    pub fn attach(&self, name: &str, hub: &Arc<RpcHub>) {
        tracing::debug!("掛上對端: {}", name);
        self.hubs.insert(name.to_string(), Arc::downgrade(hub));
    }

    /// 移除對端，之後的呼叫以暫時性錯誤失敗
    pub fn detach(&self, name: &str) -> bool {
        self.hubs.remove(name).is_some()
    }

    fn resolve(&self, peer: &str) -> Result<Arc<RpcHub>> {
        self.hubs
            .get(peer)
            .and_then(|hub| hub.upgrade())
            .ok_or_else(|| FusionError::Transient(format!("對端無法連線: {}", peer)))
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn handshake(&self, peer: &str, local: RpcHandshake, notices: NoticeSender) -> Result<RpcHandshake> {
        let hub = self.resolve(peer)?;
        hub.accept_handshake(local, notices)
    }

    async fn call(&self, peer: &str, caller: Uuid, message: RpcMessage) -> Result<Bytes> {
        let hub = self.resolve(peer)?;
        hub.handle_call(caller, message).await
    }
}
