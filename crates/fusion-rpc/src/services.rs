//! 服務方法登錄表
//!
//! 以明確註冊取代反射：每個（服務, 方法）對應一個型別化的呼叫器。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fusion_core::{ArgumentList, FusionError, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 方法定義
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcMethodDef {
    pub service: String,
    pub method: String,
}

impl RpcMethodDef {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl fmt::Display for RpcMethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// 呼入上下文
#[derive(Debug, Clone)]
pub struct RpcInboundContext {
    /// 呼叫端的對端識別碼
    pub caller: Uuid,
    pub method: RpcMethodDef,
}

/// 型別抹除的方法呼叫器
pub type RpcInvoker =
    Arc<dyn Fn(RpcInboundContext, ArgumentList) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// 服務方法登錄表
#[derive(Default)]
pub struct RpcServiceRegistry {
    methods: DashMap<RpcMethodDef, RpcInvoker>,
}

impl RpcServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 註冊呼叫器；同名方法已存在時回傳錯誤
    pub fn register(&self, method: RpcMethodDef, invoker: RpcInvoker) -> Result<()> {
        match self.methods.entry(method) {
            Entry::Occupied(entry) => Err(FusionError::Internal(format!(
                "服務方法重複註冊: {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                tracing::debug!("註冊服務方法: {}", entry.key());
                entry.insert(invoker);
                Ok(())
            }
        }
    }

    /// 註冊型別化的方法，結果以 JSON 序列化
    pub fn register_fn<T, F, Fut>(&self, service: &str, method: &str, handler: F) -> Result<()>
    where
        T: Serialize,
        F: Fn(RpcInboundContext, ArgumentList) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let invoker: RpcInvoker = Arc::new(move |ctx, args| {
            let call = handler(ctx, args);
            Box::pin(async move {
                let value = call.await?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            })
        });
        self.register(RpcMethodDef::new(service, method), invoker)
    }

    /// 取得呼叫器
    pub fn get(&self, method: &RpcMethodDef) -> Result<RpcInvoker> {
        self.methods
            .get(method)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FusionError::MethodNotFound(method.to_string()))
    }

    pub fn contains(&self, method: &RpcMethodDef) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(method: &RpcMethodDef) -> RpcInboundContext {
        RpcInboundContext {
            caller: Uuid::new_v4(),
            method: method.clone(),
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = RpcServiceRegistry::new();
        registry
            .register_fn("math", "add", |_, args: ArgumentList| async move {
                Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
            })
            .unwrap();

        let method = RpcMethodDef::new("math", "add");
        let invoker = registry.get(&method).unwrap();
        let args = ArgumentList::new().with(2).unwrap().with(3).unwrap();
        let bytes = invoker(inbound(&method), args).await.unwrap();
        assert_eq!(serde_json::from_slice::<i64>(&bytes).unwrap(), 5);
    }

    #[test]
    fn test_name_conflict_is_rejected() {
        let registry = RpcServiceRegistry::new();
        registry
            .register_fn("todo", "get", |_, _| async { Ok(1) })
            .unwrap();

        let result = registry.register_fn("todo", "get", |_, _| async { Ok(2) });
        assert!(matches!(result, Err(FusionError::Internal(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_method() {
        let registry = RpcServiceRegistry::new();
        let result = registry.get(&RpcMethodDef::new("todo", "missing"));
        assert!(matches!(result, Err(FusionError::MethodNotFound(_))));
    }
}
