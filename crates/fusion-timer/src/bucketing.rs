//! 時間分桶

use std::time::Duration;

use tokio::time::Instant;

/// 最小刻度
const MIN_TICK: Duration = Duration::from_millis(1);

/// 刻度分桶計算器
///
/// 以 `origin` 為起點，把時間切成固定長度的刻度。
/// 到期時間向上取整到刻度，目前時間向下取整，
/// 因此同一刻度內到期的項目會一起觸發，且不會早於到期時間。
#[derive(Debug, Clone, Copy)]
pub struct TickBucketer {
    origin: Instant,
    tick: Duration,
}

impl TickBucketer {
    /// 創建分桶計算器（刻度至少 1 毫秒）
    pub fn new(origin: Instant, tick: Duration) -> Self {
        Self {
            origin,
            tick: tick.max(MIN_TICK),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// 到期時間所屬的刻度：`ceil((due - origin) / tick)`
    pub fn tick_of_deadline(&self, due: Instant) -> u64 {
        let elapsed = due.saturating_duration_since(self.origin).as_nanos();
        let tick = self.tick.as_nanos();
        saturate(elapsed.div_ceil(tick))
    }

    /// 目前時間已經走完的刻度：`floor((now - origin) / tick)`
    pub fn current_tick(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        saturate(elapsed / self.tick.as_nanos())
    }

    /// 刻度的起始時間
    pub fn tick_start(&self, tick: u64) -> Instant {
        let offset = self.tick.saturating_mul(u32::try_from(tick).unwrap_or(u32::MAX));
        self.origin + offset
    }
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(9, 1)]
    #[case(10, 1)]
    #[case(11, 2)]
    #[case(100, 10)]
    fn test_deadline_rounds_up(#[case] due_ms: u64, #[case] expected: u64) {
        let origin = Instant::now();
        let bucketer = TickBucketer::new(origin, Duration::from_millis(10));

        let due = origin + Duration::from_millis(due_ms);
        assert_eq!(bucketer.tick_of_deadline(due), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(9, 0)]
    #[case(10, 1)]
    #[case(109, 10)]
    fn test_current_tick_rounds_down(#[case] now_ms: u64, #[case] expected: u64) {
        let origin = Instant::now();
        let bucketer = TickBucketer::new(origin, Duration::from_millis(10));

        let now = origin + Duration::from_millis(now_ms);
        assert_eq!(bucketer.current_tick(now), expected);
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let bucketer = TickBucketer::new(Instant::now(), Duration::ZERO);
        assert_eq!(bucketer.tick(), MIN_TICK);
    }

    #[test]
    fn test_deadline_before_origin() {
        let origin = Instant::now() + Duration::from_secs(1);
        let bucketer = TickBucketer::new(origin, Duration::from_millis(10));

        assert_eq!(bucketer.tick_of_deadline(Instant::now()), 0);
        assert_eq!(bucketer.tick_start(3), origin + Duration::from_millis(30));
    }
}
