//! 錯誤暫時性分類
//!
//! 重試策略與節點的錯誤快取都透過 [`TransiencyResolver`] 判斷錯誤是否可重試。

use std::fmt;
use std::sync::Arc;

use crate::FusionError;

/// 暫時性分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transiency {
    /// 無法判斷
    Unknown,
    /// 需要外部修正後才能重試
    NonTransient,
    /// 可重試
    Transient,
    /// 必須立即重試
    SuperTransient,
    /// 永不重試
    Terminal,
}

impl Transiency {
    /// 是否可重試（Transient 或 SuperTransient）
    pub fn is_transient(self) -> bool {
        matches!(self, Transiency::Transient | Transiency::SuperTransient)
    }

    pub fn is_unknown(self) -> bool {
        self == Transiency::Unknown
    }

    /// 無法判斷時使用備援分類
    pub fn or(self, fallback: Transiency) -> Transiency {
        if self.is_unknown() {
            fallback
        } else {
            self
        }
    }
}

type ResolveFn = dyn Fn(&FusionError) -> Transiency + Send + Sync;

/// 暫時性分類器
#[derive(Clone)]
pub struct TransiencyResolver(Arc<ResolveFn>);

impl TransiencyResolver {
    /// 從函式創建分類器
    pub fn new(resolve: impl Fn(&FusionError) -> Transiency + Send + Sync + 'static) -> Self {
        Self(Arc::new(resolve))
    }

    /// 分類錯誤
    pub fn resolve(&self, error: &FusionError) -> Transiency {
        (self.0)(error)
    }

    /// 只辨識核心錯誤，其他一律為 Unknown
    pub fn core_only() -> Self {
        Self::new(core_transiency)
    }

    /// 偏向可重試：取消視為暫時性，其餘未知錯誤為非暫時性
    pub fn prefer_transient() -> Self {
        Self::core_only().or_else(|error| match error {
            FusionError::Cancelled => Transiency::Transient,
            _ => Transiency::NonTransient,
        })
    }

    /// 偏向不可重試：所有未知錯誤（含取消）皆為非暫時性
    pub fn prefer_non_transient() -> Self {
        Self::core_only().or_else(|_| Transiency::NonTransient)
    }

    /// 組合分類器：本分類器回傳 Unknown 時改用 `fallback`
    pub fn or_else(self, fallback: impl Fn(&FusionError) -> Transiency + Send + Sync + 'static) -> Self {
        Self::new(move |error| match self.resolve(error) {
            Transiency::Unknown => fallback(error),
            known => known,
        })
    }
}

impl Default for TransiencyResolver {
    fn default() -> Self {
        Self::prefer_transient()
    }
}

impl fmt::Debug for TransiencyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransiencyResolver").finish_non_exhaustive()
    }
}

fn core_transiency(error: &FusionError) -> Transiency {
    match error {
        FusionError::RetryRequired(_) => Transiency::SuperTransient,
        FusionError::Transient(_) | FusionError::Timeout(_) | FusionError::LogEntryNotFound(_) => {
            Transiency::Transient
        }
        FusionError::RetryPolicyTimeout(_) => Transiency::NonTransient,
        FusionError::Terminal(_) | FusionError::Disposed(_) => Transiency::Terminal,
        _ => Transiency::Unknown,
    }
}
