//! 待辦事項示例：命令寫入、跨主機失效推送、操作日誌重播

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fusion::fusion_ops::{
    InMemoryLog, InvalidationLogProcessor, InvalidationPayload, LogProcessingLoop, LogProcessorConfig,
};
use fusion::fusion_rpc::FixedRouter;
use fusion::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

type TodoStore = Arc<Mutex<BTreeMap<u32, String>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddTodo {
    id: u32,
    title: String,
}

impl Command for AddTodo {
    const TYPE: &'static str = "todo.add";
    type Output = usize;
}

fn list_input() -> Result<ComputedInput> {
    ComputedInput::new("todo", "list", &ArgumentList::new())
}

async fn list_todos(graph: &ComputedGraph, ctx: &ComputeContext, store: &TodoStore) -> Result<Vec<String>> {
    graph
        .compute(ctx, list_input()?, async { Ok(store.lock().values().cloned().collect()) })
        .await
}

fn commander(graph: ComputedGraph, store: TodoStore, log: Option<Arc<InMemoryLog>>) -> Commander {
    let mut registry = CommandHandlerRegistry::new();
    registry
        .add_filter::<AddTodo, _, _>("todo.audit", 10, |command, ctx| async move {
            if !ctx.is_invalidating() {
                tracing::info!("新增待辦 #{}", command.id);
            }
            ctx.proceed_typed(&command).await
        })
        .add_handler::<AddTodo, _, _>("todo.store", 0, move |command, ctx| {
            let graph = graph.clone();
            let store = store.clone();
            let log = log.clone();
            async move {
                if ctx.is_invalidating() {
                    let _ = list_todos(&graph, ctx.compute_context(), &store).await;
                    return Ok(0);
                }
                if let Some(log) = &log {
                    let payload = InvalidationPayload::Command {
                        command_type: AddTodo::TYPE.to_string(),
                        command: serde_json::to_value(&command)?,
                    };
                    log.append(serde_json::to_value(payload)?);
                }
                let mut todos = store.lock();
                todos.insert(command.id, command.title);
                Ok(todos.len())
            }
        });
    Commander::new(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== 待辦事項示例 ===\n");

    let store: TodoStore = Arc::new(Mutex::new(BTreeMap::from([(1, "買牛奶".to_string())])));
    let log = Arc::new(InMemoryLog::new());

    // 主機 A：發佈 todo.list
    let transport = Arc::new(LoopbackTransport::new());
    let host_a = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
    let graph_a = ComputedGraph::new(FusionConfig::new());
    let publisher = RpcComputedPublisher::new(&host_a, graph_a.clone());
    {
        let graph = graph_a.clone();
        let store = store.clone();
        publisher.publish("todo", "list", move |ctx, _| {
            let graph = graph.clone();
            let store = store.clone();
            async move { list_todos(&graph, &ctx, &store).await }
        })?;
    }
    transport.attach("host-a", &host_a);
    let commander_a = commander(graph_a.clone(), store.clone(), Some(log.clone()));

    // 主機 B：共用資料，以操作日誌同步失效
    let graph_b = ComputedGraph::new(FusionConfig::new());
    let commander_b = Arc::new(commander(graph_b.clone(), store.clone(), None));
    let processor = Arc::new(InvalidationLogProcessor::new(graph_b.clone()).with_commander(commander_b));
    let cancel = CancellationToken::new();
    let replay = LogProcessingLoop::new(
        log.clone(),
        processor,
        LogProcessorConfig::new().with_forced_check_period(Duration::from_millis(200)),
        cancel.clone(),
    );
    let replay_task = replay.spawn();

    // 用戶端：透過 RPC 讀取主機 A
    let client_hub = Arc::new(
        RpcHub::new(RpcConfig::new(), transport.clone()).with_router(FixedRouter(RpcPeerRef::remote("host-a"))),
    );
    let client = Arc::new(RemoteComputeClient::new(client_hub, ComputedGraph::new(FusionConfig::new())));
    let listener = client.spawn_notice_listener(cancel.clone())?;

    let ctx = ComputeContext::new();
    let todos: Vec<String> = client.call(&ctx, "todo", "list", ArgumentList::new()).await?;
    println!("用戶端讀取: {:?}", todos);
    println!("主機 B 讀取: {:?}\n", list_todos(&graph_b, &ctx, &store).await?);

    let count = commander_a
        .call(AddTodo {
            id: 2,
            title: "繳電費".to_string(),
        })
        .await?;
    println!("新增後共 {} 項", count);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let todos: Vec<String> = client.call(&ctx, "todo", "list", ArgumentList::new()).await?;
    println!("用戶端重新讀取: {:?}", todos);
    println!("主機 B 重新讀取: {:?}", list_todos(&graph_b, &ctx, &store).await?);

    cancel.cancel();
    let _ = tokio::join!(replay_task, listener);
    Ok(())
}
