//! 呼出呼叫的上下文與狀態機

use std::fmt;

use bytes::Bytes;
use fusion_core::{ArgumentList, FusionError, Result};
use tokio_util::sync::CancellationToken;

use crate::cache_key::{RpcCacheInfoCapture, RpcCacheInfoCaptureMode, RpcCacheKey};
use crate::peer::{RpcCallRouter, RpcPeerRef};
use crate::services::RpcMethodDef;

/// 呼叫狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCallState {
    Prepared,
    Local,
    Dispatched,
    Completed,
    Failed,
    Rerouted,
    Cancelled,
}

impl RpcCallState {
    fn can_transition_to(self, next: RpcCallState) -> bool {
        use RpcCallState::*;
        matches!(
            (self, next),
            (Prepared, Local | Dispatched | Cancelled)
                | (Local, Completed | Failed | Cancelled)
                | (Dispatched, Completed | Failed | Rerouted | Cancelled)
                | (Rerouted, Prepared)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            RpcCallState::Completed | RpcCallState::Failed | RpcCallState::Cancelled
        )
    }
}

impl fmt::Display for RpcCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 一次呼出呼叫
#[derive(Debug)]
pub struct RpcOutboundCall {
    pub id: u64,
    pub peer: RpcPeerRef,
    state: RpcCallState,
}

impl RpcOutboundCall {
    pub fn new(id: u64, peer: RpcPeerRef) -> Self {
        Self {
            id,
            peer,
            state: RpcCallState::Prepared,
        }
    }

    pub fn state(&self) -> RpcCallState {
        self.state
    }

    /// 轉換狀態，非法轉換回傳內部錯誤
    pub fn transition(&mut self, next: RpcCallState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(FusionError::Internal(format!(
                "呼叫 #{} 不能從 {} 轉為 {}",
                self.id, self.state, next
            )));
        }
        tracing::trace!("呼叫 #{}: {} → {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// 重新路由到新對端，回到 Prepared
    pub fn reroute_to(&mut self, peer: RpcPeerRef) -> Result<()> {
        self.transition(RpcCallState::Rerouted)?;
        self.peer = peer;
        self.transition(RpcCallState::Prepared)
    }
}

/// 呼出上下文
///
/// 攜帶方法、參數、預選對端、快取擷取與取消權杖；重新路由時沿用同一個上下文。
#[derive(Debug)]
pub struct RpcOutboundContext {
    pub method: RpcMethodDef,
    pub arguments: ArgumentList,
    pinned_peer: Option<RpcPeerRef>,
    peer: Option<RpcPeerRef>,
    cache_info_capture: Option<RpcCacheInfoCapture>,
    cancel: CancellationToken,
    reroute_count: u32,
}

impl RpcOutboundContext {
    pub fn new(method: RpcMethodDef, arguments: ArgumentList) -> Self {
        Self {
            method,
            arguments,
            pinned_peer: None,
            peer: None,
            cache_info_capture: None,
            cancel: CancellationToken::new(),
            reroute_count: 0,
        }
    }

    /// 預選對端；之後此呼叫不能重新路由
    pub fn with_peer(mut self, peer: RpcPeerRef) -> Self {
        self.pinned_peer = Some(peer);
        self
    }

    pub fn with_cache_info_capture(mut self, mode: RpcCacheInfoCaptureMode) -> Self {
        self.cache_info_capture = Some(RpcCacheInfoCapture::new(mode));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn peer(&self) -> Option<&RpcPeerRef> {
        self.peer.as_ref()
    }

    pub fn reroute_count(&self) -> u32 {
        self.reroute_count
    }

    pub fn cache_info_capture(&self) -> Option<&RpcCacheInfoCapture> {
        self.cache_info_capture.as_ref()
    }

    pub(crate) fn cache_info_capture_mut(&mut self) -> Option<&mut RpcCacheInfoCapture> {
        self.cache_info_capture.as_mut()
    }

    /// 取出擷取的快取資訊
    pub fn take_cache_info_capture(&mut self) -> Option<RpcCacheInfoCapture> {
        self.cache_info_capture.take()
    }

    /// 送出前計算快取鍵（需要擷取且尚未計算時）
    pub fn must_capture_cache_key(&mut self) -> Result<Option<&RpcCacheKey>> {
        let Some(capture) = self.cache_info_capture.as_mut() else {
            return Ok(None);
        };
        if capture.key.is_none() {
            capture.key = Some(RpcCacheKey::new(&self.method, &self.arguments)?);
        }
        Ok(capture.key.as_ref())
    }

    /// 記錄回應資料到快取擷取
    pub(crate) fn capture_response(&mut self, data: &Bytes) {
        if let Some(capture) = self.cache_info_capture_mut() {
            capture.capture_data(data);
        }
    }

    /// 選擇對端：預選對端優先，否則詢問路由
    pub fn prepare_call(&mut self, router: &dyn RpcCallRouter) -> Result<RpcPeerRef> {
        let peer = match &self.pinned_peer {
            Some(peer) => peer.clone(),
            None => router.route(&self.method, &self.arguments)?,
        };
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    /// 為重新路由選擇新對端
    pub fn prepare_reroute(&mut self, router: &dyn RpcCallRouter) -> Result<RpcPeerRef> {
        if self.pinned_peer.is_some() {
            return Err(FusionError::Internal(format!(
                "此呼叫無法重新路由: {}",
                self.method
            )));
        }
        self.reroute_count += 1;
        let peer = router.route(&self.method, &self.arguments)?;
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    /// 路由結果是否已不同於目前對端
    pub fn is_peer_changed(&self, router: &dyn RpcCallRouter) -> bool {
        if self.pinned_peer.is_some() {
            return false;
        }
        match router.route(&self.method, &self.arguments) {
            Ok(peer) => self.peer.as_ref() != Some(&peer),
            Err(_) => false,
        }
    }
}
