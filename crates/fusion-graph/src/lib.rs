//! # Fusion Graph
//!
//! 相依追蹤的記憶化計算圖：節點、擷取範圍、失效傳播

pub mod context;
pub mod graph;
pub mod invalidation;
pub mod node;
pub(crate) mod registry;

// Re-export 主要類型
pub use context::{ComputeContext, ContextScope};
pub use graph::ComputedGraph;
pub use invalidation::NodeTimer;
pub use node::{ComputedId, ComputedOutput, ComputedValue, ConsistencyState, Node, UsedByEdge};
