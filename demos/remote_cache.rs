//! 遠端計算與客戶端快取示例
//!
//! 伺服端發佈一個計算方法，客戶端透過 loopback 傳輸呼叫，
//! 回應寫入客戶端快取；伺服端離線時以快取值回應。

use std::sync::Arc;
use std::time::Duration;

use fusion::fusion_rpc::{CacheStore, ClientComputedCache, FixedRouter, RemoteCacheMode};
use fusion::prelude::*;
use parking_lot::Mutex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== 遠端快取示例 ===\n");

    let transport = Arc::new(LoopbackTransport::new());
    let server = Arc::new(RpcHub::new(RpcConfig::new(), transport.clone()));
    let server_graph = ComputedGraph::new(FusionConfig::new());
    let temperature = Arc::new(Mutex::new(21.5_f64));

    let publisher = RpcComputedPublisher::new(&server, server_graph.clone());
    {
        let graph = server_graph.clone();
        let temperature = temperature.clone();
        publisher.publish("weather", "current", move |ctx, args| {
            let graph = graph.clone();
            let temperature = temperature.clone();
            async move {
                let city: String = args.get(0)?;
                let input = ComputedInput::new("weather", "current", &args)?;
                graph
                    .compute(&ctx, input, async move { Ok(format!("{}: {:.1}°C", city, *temperature.lock())) })
                    .await
            }
        })?;
    }
    transport.attach("weather-server", &server);

    let config = RpcConfig::new().with_remote_cache_mode(RemoteCacheMode::NetworkFirst);
    let client_hub = Arc::new(
        RpcHub::new(config, transport.clone()).with_router(FixedRouter(RpcPeerRef::remote("weather-server"))),
    );
    let cache = Arc::new(FlushingClientComputedCache::in_memory(Duration::from_millis(50)));
    let client = RemoteComputeClient::new(client_hub, ComputedGraph::new(FusionConfig::new())).with_cache(cache.clone());

    let args = ArgumentList::new().with("台北")?;
    let ctx = ComputeContext::new();
    let report: String = client.call(&ctx, "weather", "current", args.clone()).await?;
    println!("線上讀取: {}", report);

    cache.flush();
    println!("快取筆數: {}", cache.store().len());

    // 伺服端離線，且客戶端節點過期
    transport.detach("weather-server");
    let input = ComputedInput::new("weather", "current", &args)?;
    if let Ok(node) = client.graph().get_existing(&input) {
        client.graph().invalidate_now(&node);
    }

    let report: String = client.call(&ctx, "weather", "current", args).await?;
    println!("離線讀取（快取）: {}", report);
    Ok(())
}
