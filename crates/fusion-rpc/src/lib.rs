//! # Fusion RPC
//!
//! 快取橋接：把計算圖延伸到遠端呼叫邊界
//!
//! - 呼叫前計算快取鍵（[`RpcCacheKey`]）
//! - 客戶端本地快取（[`FlushingClientComputedCache`]）
//! - 伺服端推送失效通知（[`RpcComputedPublisher`] → [`RemoteComputeClient`]）
//! - 對端握手與版本檢查（[`RpcHandshake`]）

pub mod cache_key;
pub mod client_cache;
pub mod config;
pub mod handshake;
pub mod hub;
pub mod outbound;
pub mod peer;
pub mod publisher;
pub mod remote;
pub mod services;
pub mod transport;

// Re-export 主要類型
pub use cache_key::{RpcCacheInfoCapture, RpcCacheInfoCaptureMode, RpcCacheKey};
pub use client_cache::{
    CacheBatch, CacheStore, ClientComputedCache, FlushingClientComputedCache, InMemoryCacheStore,
};
pub use config::{RemoteCacheMode, RpcConfig};
pub use handshake::RpcHandshake;
pub use hub::RpcHub;
pub use outbound::{RpcCallState, RpcOutboundCall, RpcOutboundContext};
pub use peer::{FixedRouter, RpcCallRouter, RpcPeer, RpcPeerRef};
pub use publisher::RpcComputedPublisher;
pub use remote::RemoteComputeClient;
pub use services::{RpcInboundContext, RpcInvoker, RpcMethodDef, RpcServiceRegistry};
pub use transport::{LoopbackTransport, NoticeSender, RpcInvalidationNotice, RpcMessage, RpcTransport};
