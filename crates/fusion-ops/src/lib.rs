//! # Fusion Ops
//!
//! 計算圖的外部協作者：
//! 重試策略、失效日誌處理（含缺口重試）與命令處理器鏈（含失效重播）。

pub mod commander;
pub mod log_processor;
pub mod retry;

// Re-export 主要類型
pub use commander::{
    Command, CommandContext, CommandHandler, CommandHandlerChain, CommandHandlerRegistry,
    CommandHandlerResolver, Commander,
};
pub use log_processor::{
    InMemoryLog, InvalidationLogProcessor, InvalidationPayload, LogEntry, LogEntryProcessor,
    LogProcessingLoop, LogProcessorConfig, LogReader,
};
pub use retry::{RetryDelaySeq, RetryPolicy};
