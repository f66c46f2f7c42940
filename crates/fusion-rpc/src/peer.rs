//! 對端與呼叫路由

use std::fmt;

use fusion_core::{ArgumentList, Result};
use tokio::sync::OnceCell;

use crate::handshake::RpcHandshake;
use crate::services::RpcMethodDef;

/// 對端參照
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcPeerRef {
    /// 本機：直接呼叫本地服務登錄表
    Local,
    /// 遠端：以傳輸層名稱定址
    Remote(String),
}

impl RpcPeerRef {
    pub fn remote(name: &str) -> Self {
        RpcPeerRef::Remote(name.to_string())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RpcPeerRef::Local)
    }
}

impl fmt::Display for RpcPeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcPeerRef::Local => write!(f, "local"),
            RpcPeerRef::Remote(name) => write!(f, "remote:{}", name),
        }
    }
}

/// 遠端對端：每個連線只握手一次
#[derive(Debug)]
pub struct RpcPeer {
    name: String,
    handshake: OnceCell<RpcHandshake>,
}

impl RpcPeer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handshake: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 已完成的握手
    pub fn handshake(&self) -> Option<&RpcHandshake> {
        self.handshake.get()
    }

    pub(crate) fn handshake_cell(&self) -> &OnceCell<RpcHandshake> {
        &self.handshake
    }
}

/// 呼叫路由：依方法與參數選擇對端
pub trait RpcCallRouter: Send + Sync {
    fn route(&self, method: &RpcMethodDef, arguments: &ArgumentList) -> Result<RpcPeerRef>;
}

impl<F> RpcCallRouter for F
where
    F: Fn(&RpcMethodDef, &ArgumentList) -> Result<RpcPeerRef> + Send + Sync,
{
    fn route(&self, method: &RpcMethodDef, arguments: &ArgumentList) -> Result<RpcPeerRef> {
        self(method, arguments)
    }
}

/// 固定路由：所有呼叫都送往同一個對端
#[derive(Debug, Clone)]
pub struct FixedRouter(pub RpcPeerRef);

impl RpcCallRouter for FixedRouter {
    fn route(&self, _method: &RpcMethodDef, _arguments: &ArgumentList) -> Result<RpcPeerRef> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_router() {
        let router = |method: &RpcMethodDef, _: &ArgumentList| -> Result<RpcPeerRef> {
            if method.service == "local" {
                Ok(RpcPeerRef::Local)
            } else {
                Ok(RpcPeerRef::remote("server"))
            }
        };

        let args = ArgumentList::new();
        let local = router.route(&RpcMethodDef::new("local", "x"), &args).unwrap();
        let remote = router.route(&RpcMethodDef::new("todo", "get"), &args).unwrap();
        assert!(local.is_local());
        assert_eq!(remote, RpcPeerRef::remote("server"));
        assert_eq!(remote.to_string(), "remote:server");
    }
}
