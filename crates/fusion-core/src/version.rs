//! 節點版本

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// 節點版本號
///
/// 由 [`VersionGenerator`] 產生，同一產生器的版本嚴格遞增。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// 尚未指派的版本
    pub const NONE: Version = Version(0);
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// 版本產生器（執行緒安全）
#[derive(Debug)]
pub struct VersionGenerator {
    last: AtomicU64,
}

impl VersionGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// 取得下一個版本
    pub fn next(&self) -> Version {
        Version(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Default for VersionGenerator {
    fn default() -> Self {
        Self::new()
    }
}
