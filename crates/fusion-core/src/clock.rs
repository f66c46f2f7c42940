//! 時鐘來源
//!
//! 排程器與節點逾時都透過 [`MomentClock`] 取得目前時間，
//! 不使用隱藏的全域時鐘。正式環境使用 [`SystemClock`]（tokio 時間，
//! 測試時可暫停），需要完全手動控制時使用 [`ManualClock`]。

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// 時鐘介面
pub trait MomentClock: Send + Sync + Debug {
    /// 目前時間
    fn now(&self) -> Instant;
}

/// 系統時鐘（tokio 時間）
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl MomentClock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手動時鐘
///
/// 從建立時刻開始，只有呼叫 `advance` 才會前進。
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// 創建新的手動時鐘
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 前進指定時間
    pub fn advance(&self, delta: Duration) {
        let delta_ms = u64::try_from(delta.as_millis()).unwrap_or(u64::MAX);
        self.offset_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// 已前進的總時間
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MomentClock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

/// 取得預設時鐘
pub fn default_clock() -> Arc<dyn MomentClock> {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));

        // 複製的時鐘共用同一個偏移
        let shared = clock.clone();
        shared.advance(Duration::from_millis(750));
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_tokio_time() {
        let clock = SystemClock;
        let start = clock.now();

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(clock.now() - start >= Duration::from_millis(40));
    }
}
