//! 命令處理器鏈
//!
//! 處理器以命令類型名稱明確註冊，不做型別掃描。
//! 每個命令類型的處理器依優先權由高到低排成一條鏈：
//! 過濾器可以有多個，最終處理器最多一個。
//!
//! [`Commander::call`] 執行完命令後，會在失效範圍內再跑一次同一條鏈，
//! 讓處理器重新讀取受影響的計算方法以使它們失效。

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use fusion_core::{FusionError, Result};
use fusion_graph::ComputeContext;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// 命令
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 命令類型名稱（處理器以此查找）
    const TYPE: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;
}

type HandlerFn = Arc<dyn Fn(Value, CommandContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// 命令處理器
#[derive(Clone)]
pub struct CommandHandler {
    pub id: String,
    pub command_type: String,
    pub priority: i32,
    pub is_filter: bool,
    invoke: HandlerFn,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("id", &self.id)
            .field("command_type", &self.command_type)
            .field("priority", &self.priority)
            .field("is_filter", &self.is_filter)
            .finish()
    }
}

/// 已解析的處理器鏈
pub type CommandHandlerChain = Arc<[CommandHandler]>;

/// 處理器執行時的上下文
#[derive(Clone)]
pub struct CommandContext {
    command_type: String,
    chain: CommandHandlerChain,
    next: usize,
    compute: Arc<ComputeContext>,
    invalidating: bool,
}

impl CommandContext {
    fn new(command_type: &str, chain: CommandHandlerChain, compute: Arc<ComputeContext>, invalidating: bool) -> Self {
        Self {
            command_type: command_type.to_string(),
            chain,
            next: 0,
            compute,
            invalidating,
        }
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    /// 讀取計算圖用的上下文；失效重播時它位於失效範圍內
    pub fn compute_context(&self) -> &Arc<ComputeContext> {
        &self.compute
    }

    /// 是否為失效重播
    pub fn is_invalidating(&self) -> bool {
        self.invalidating
    }

    /// 執行鏈上的下一個處理器
    pub fn proceed(&self, command: Value) -> BoxFuture<'static, Result<Value>> {
        let Some(handler) = self.chain.get(self.next).cloned() else {
            let error = FusionError::Internal(format!("命令 {} 沒有最終處理器", self.command_type));
            return Box::pin(async move { Err(error) });
        };
        let mut next = self.clone();
        next.next += 1;
        (handler.invoke)(command, next)
    }

    /// 執行下一個處理器並解碼結果
    pub async fn proceed_typed<C: Command>(&self, command: &C) -> Result<C::Output> {
        let value = self.proceed(serde_json::to_value(command)?).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// 處理器登錄表
#[derive(Default)]
pub struct CommandHandlerRegistry {
    handlers: Vec<CommandHandler>,
}

impl CommandHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 註冊最終處理器
    pub fn add_handler<C, F, Fut>(&mut self, id: &str, priority: i32, handler: F) -> &mut Self
    where
        C: Command,
        F: Fn(C, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output>> + Send + 'static,
    {
        self.add::<C, F, Fut>(id, priority, false, handler)
    }

    /// 註冊過濾器；過濾器透過 [`CommandContext::proceed_typed`] 呼叫鏈上的下一個處理器
    pub fn add_filter<C, F, Fut>(&mut self, id: &str, priority: i32, filter: F) -> &mut Self
    where
        C: Command,
        F: Fn(C, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output>> + Send + 'static,
    {
        self.add::<C, F, Fut>(id, priority, true, filter)
    }

    fn add<C, F, Fut>(&mut self, id: &str, priority: i32, is_filter: bool, handler: F) -> &mut Self
    where
        C: Command,
        F: Fn(C, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output>> + Send + 'static,
    {
        let invoke: HandlerFn = Arc::new(move |command, ctx| match serde_json::from_value::<C>(command) {
            Ok(command) => {
                let call = handler(command, ctx);
                Box::pin(async move { Ok(serde_json::to_value(call.await?)?) })
            }
            Err(e) => {
                let error = FusionError::from(e);
                Box::pin(async move { Err(error) })
            }
        });

        self.handlers.push(CommandHandler {
            id: id.to_string(),
            command_type: C::TYPE.to_string(),
            priority,
            is_filter,
            invoke,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// 處理器解析（依命令類型快取）
pub struct CommandHandlerResolver {
    registry: CommandHandlerRegistry,
    cache: DashMap<String, CommandHandlerChain>,
}

impl CommandHandlerResolver {
    pub fn new(registry: CommandHandlerRegistry) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
        }
    }

    /// 解析命令類型的處理器鏈：優先權由高到低，同優先權保持註冊順序
    pub fn resolve_handlers(&self, command_type: &str) -> Result<CommandHandlerChain> {
        if let Some(chain) = self.cache.get(command_type) {
            return Ok(chain.clone());
        }

        let mut handlers: Vec<CommandHandler> = self
            .registry
            .handlers
            .iter()
            .filter(|h| h.command_type == command_type)
            .cloned()
            .collect();
        handlers.sort_by(|a, b| b.priority.cmp(&a.priority));

        let finals: Vec<&str> = handlers
            .iter()
            .filter(|h| !h.is_filter)
            .map(|h| h.id.as_str())
            .collect();
        if finals.len() > 1 {
            tracing::error!("命令 {} 有多個最終處理器: {:?}", command_type, finals);
            return Err(FusionError::Internal(format!(
                "命令 {} 有多個最終處理器: {}",
                command_type,
                finals.join(", ")
            )));
        }

        let chain: CommandHandlerChain = handlers.into();
        self.cache.insert(command_type.to_string(), chain.clone());
        Ok(chain)
    }
}

/// 命令執行器
pub struct Commander {
    resolver: CommandHandlerResolver,
}

impl Commander {
    pub fn new(registry: CommandHandlerRegistry) -> Self {
        Self {
            resolver: CommandHandlerResolver::new(registry),
        }
    }

    pub fn resolver(&self) -> &CommandHandlerResolver {
        &self.resolver
    }

    /// 執行命令，成功後在失效範圍內重播處理器鏈
    pub async fn call<C: Command>(&self, command: C) -> Result<C::Output> {
        let value = serde_json::to_value(&command)?;
        let result = self.call_value(C::TYPE, value).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// 以 JSON 值執行命令
    pub async fn call_value(&self, command_type: &str, command: Value) -> Result<Value> {
        let chain = self.resolver.resolve_handlers(command_type)?;
        tracing::debug!("執行命令 {}（{} 個處理器）", command_type, chain.len());

        let ctx = CommandContext::new(command_type, chain, Arc::new(ComputeContext::new()), false);
        let result = ctx.proceed(command.clone()).await?;

        self.invalidate_value(command_type, command).await?;
        Ok(result)
    }

    /// 只執行失效重播（例如從其他節點的操作日誌重播）
    pub async fn invalidate_value(&self, command_type: &str, command: Value) -> Result<()> {
        let chain = self.resolver.resolve_handlers(command_type)?;
        let compute = Arc::new(ComputeContext::new());
        let _scope = compute.begin_invalidation();

        let ctx = CommandContext::new(command_type, chain, compute.clone(), true);
        match ctx.proceed(command).await {
            Ok(_) | Err(FusionError::InvalidationOnly) => Ok(()),
            Err(e) => {
                tracing::warn!("命令 {} 的失效重播失敗: {}", command_type, e);
                Err(e)
            }
        }
    }
}
