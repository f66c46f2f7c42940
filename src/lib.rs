//! # Fusion
//!
//! 增量計算與分散式快取一致性引擎
//!
//! - [`fusion_core`]：錯誤、計算輸入、版本、配置
//! - [`fusion_timer`]：依 tick 分桶的並行計時器
//! - [`fusion_graph`]：相依追蹤的記憶化計算圖
//! - [`fusion_rpc`]：遠端呼叫的快取橋接與失效通知
//! - [`fusion_ops`]：重試策略、失效日誌處理、命令處理器鏈

pub use fusion_core;
pub use fusion_graph;
pub use fusion_ops;
pub use fusion_rpc;
pub use fusion_timer;

pub use fusion_core::{
    ArgumentList, ComputedInput, ComputedOptions, FusionConfig, FusionError, Result, VersionSet,
};
pub use fusion_graph::{ComputeContext, ComputedGraph, Node};

/// 常用類型
pub mod prelude {
    pub use fusion_core::{
        ArgumentList, ComputedInput, ComputedOptions, FusionConfig, FusionError, Result,
        TransiencyResolver, VersionSet,
    };
    pub use fusion_graph::{ComputeContext, ComputedGraph, Node};
    pub use fusion_ops::{Command, CommandContext, CommandHandlerRegistry, Commander};
    pub use fusion_rpc::{
        FlushingClientComputedCache, LoopbackTransport, RemoteComputeClient, RpcComputedPublisher,
        RpcConfig, RpcHub, RpcPeerRef,
    };
}
