//! 重試策略

use std::future::Future;
use std::time::Duration;

use fusion_core::{FusionError, Result, Transiency, TransiencyResolver};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use fusion_core::config::duration_ms;

/// 指數延遲序列：`min × multiplier^n`，上限 `max`，再加上 ±`spread` 的隨機抖動
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDelaySeq {
    #[serde(with = "duration_ms")]
    pub min: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
    pub spread: f64,
    pub multiplier: f64,
}

impl RetryDelaySeq {
    /// 指數序列（抖動 10%，每次加倍）
    pub fn exp(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            spread: 0.1,
            multiplier: 2.0,
        }
    }

    /// 固定延遲
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
            spread: 0.0,
            multiplier: 1.0,
        }
    }

    pub fn with_spread(mut self, spread: f64) -> Self {
        self.spread = spread.clamp(0.0, 1.0);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// 第 `attempt` 次（從 0 起算）重試前的基準延遲
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = (self.min.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// 加上抖動後的延遲
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.spread <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let jitter = rand::thread_rng().gen_range(-self.spread..=self.spread);
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }
}

/// 重試策略
///
/// 非暫時性與終止性錯誤直接回傳；超暫時性錯誤立即重試；
/// 暫時性錯誤依延遲序列等待後重試，直到次數或時間上限。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub try_count: Option<u32>,
    pub timeout: Option<Duration>,
    pub delays: RetryDelaySeq,
    resolver: TransiencyResolver,
}

impl RetryPolicy {
    pub fn new(try_count: Option<u32>, timeout: Option<Duration>, delays: RetryDelaySeq) -> Self {
        Self {
            try_count,
            timeout,
            delays,
            resolver: TransiencyResolver::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: TransiencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// 執行並依策略重試；`operation` 收到目前的嘗試次數（從 0 起算）
    pub async fn apply<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = tokio::time::Instant::now();
        let mut attempt = 0;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;

            let transiency = self.resolver.resolve(&error);
            if matches!(
                transiency,
                Transiency::Terminal | Transiency::NonTransient | Transiency::Unknown
            ) {
                return Err(error);
            }
            if self.try_count.is_some_and(|count| attempt >= count) {
                tracing::debug!("重試次數用盡（{} 次）: {}", attempt, error);
                return Err(error);
            }

            let delay = match transiency {
                Transiency::SuperTransient => Duration::ZERO,
                _ => self.delays.delay(attempt - 1),
            };
            if let Some(timeout) = self.timeout {
                if started.elapsed() + delay > timeout {
                    return Err(FusionError::RetryPolicyTimeout(error.to_string()));
                }
            }

            tracing::debug!("第 {} 次失敗，{:?} 後重試: {}", attempt, delay, error);
            tokio::select! {
                _ = cancel.cancelled() => return Err(FusionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
