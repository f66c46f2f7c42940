//! # Fusion Timer
//!
//! 到期排程器：分片的粗粒度計時器集合

pub mod bucketing;
pub mod timer_set;

// Re-export 主要類型
pub use bucketing::TickBucketer;
pub use timer_set::{ConcurrentTimerSet, TimerSetOptions};
