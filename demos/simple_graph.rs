//! 計算圖基本示例：相依追蹤與失效傳播

use std::collections::HashMap;
use std::sync::Arc;

use fusion::prelude::*;
use parking_lot::Mutex;

type Prices = Mutex<HashMap<String, i64>>;

async fn price(graph: &ComputedGraph, ctx: &ComputeContext, prices: &Prices, sku: &str) -> Result<i64> {
    let input = ComputedInput::new("shop", "price", &ArgumentList::new().with(sku)?)?;
    graph
        .compute(ctx, input, async {
            println!("  計算 price({})", sku);
            Ok(prices.lock().get(sku).copied().unwrap_or(0))
        })
        .await
}

async fn cart_total(graph: &ComputedGraph, ctx: &ComputeContext, prices: &Prices, items: &[&str]) -> Result<i64> {
    let input = ComputedInput::new("shop", "cart_total", &ArgumentList::new().with(items)?)?;
    graph
        .compute(ctx, input, async {
            println!("  計算 cart_total({:?})", items);
            let mut total = 0;
            for sku in items {
                total += price(graph, ctx, prices, sku).await?;
            }
            Ok(total)
        })
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== 計算圖示例 ===\n");

    let graph = ComputedGraph::new(FusionConfig::new());
    let prices: Arc<Prices> = Arc::new(Mutex::new(HashMap::from([
        ("apple".to_string(), 30),
        ("bread".to_string(), 55),
    ])));
    let cart = ["apple", "bread"];
    let ctx = Arc::new(ComputeContext::new());

    println!("第一次讀取:");
    println!("  總計 = {}\n", cart_total(&graph, &ctx, &prices, &cart).await?);

    println!("第二次讀取（全部命中快取）:");
    println!("  總計 = {}\n", cart_total(&graph, &ctx, &prices, &cart).await?);

    println!("調整 apple 價格並使它失效:");
    prices.lock().insert("apple".to_string(), 35);
    let apple = ComputedInput::new("shop", "price", &ArgumentList::new().with("apple")?)?;
    graph.invalidate_input(&apple);

    println!("第三次讀取（只重算受影響的節點）:");
    let node = graph.capture(&ctx, cart_total(&graph, &ctx, &prices, &cart)).await?;
    println!("  總計 = {} ({})", node.value::<i64>()?, node.version());

    println!("\n快取節點數: {}", graph.node_count());
    Ok(())
}
