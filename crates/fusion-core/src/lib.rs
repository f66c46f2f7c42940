//! # Fusion Core
//!
//! 核心資料模型與類型定義

pub mod clock;
pub mod config;
pub mod input;
pub mod transiency;
pub mod version;
pub mod version_set;

// Re-export 主要類型
pub use clock::{ManualClock, MomentClock, SystemClock};
pub use config::{ComputedOptions, FusionConfig};
pub use input::{ArgumentList, ComputedInput};
pub use transiency::{Transiency, TransiencyResolver};
pub use version::{Version, VersionGenerator};
pub use version_set::{ApiVersion, VersionSet};

/// Fusion 錯誤類型
///
/// 節點會把錯誤當作結果快取起來，所以此類型必須可複製。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FusionError {
    #[error("目前沒有正在計算的節點")]
    NoCurrentComputed,

    #[error("沒有擷取到任何節點")]
    NothingCaptured,

    #[error("快取中沒有現成的節點: {0}")]
    NoExistingComputed(String),

    #[error("失效模式下不產生計算結果")]
    InvalidationOnly,

    #[error("節點尚未完成計算: {0}")]
    NotCompleted(String),

    #[error("需要立即重試: {0}")]
    RetryRequired(String),

    #[error("暫時性錯誤: {0}")]
    Transient(String),

    #[error("操作逾時: {0}")]
    Timeout(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("服務錯誤: {0}")]
    Service(String),

    #[error("版本不相容：範圍 {scope} 需要 {required}，遠端為 {actual}")]
    VersionMismatch {
        scope: String,
        required: String,
        actual: String,
    },

    #[error("重試策略逾時: {0}")]
    RetryPolicyTimeout(String),

    #[error("呼叫需要重新路由: {0}")]
    Reroute(String),

    #[error("已終止: {0}")]
    Terminal(String),

    #[error("宿主已釋放: {0}")]
    Disposed(String),

    #[error("內部錯誤: {0}")]
    Internal(String),

    #[error("找不到日誌項目: #{0}")]
    LogEntryNotFound(u64),

    #[error("找不到服務方法: {0}")]
    MethodNotFound(String),

    #[error("序列化錯誤: {0}")]
    Serialization(String),

    #[error("格式錯誤: {0}")]
    Format(String),

    #[error("其他錯誤: {0}")]
    Other(String),
}

impl FusionError {
    /// 是否為取消類錯誤
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FusionError::Cancelled)
    }
}

impl From<serde_json::Error> for FusionError {
    fn from(error: serde_json::Error) -> Self {
        FusionError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
