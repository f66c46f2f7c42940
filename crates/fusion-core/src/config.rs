//! Fusion 配置模型

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// 計算節點選項
///
/// 每個計算方法可以有自己的選項，未指定時使用 [`FusionConfig::default_options`]。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputedOptions {
    /// 最短快取時間：在此期間內即使沒有相依者也保持節點存活
    #[serde(with = "option_duration_ms")]
    pub min_cache_duration: Option<Duration>,

    /// 自動失效延遲（值的存活時間）
    #[serde(with = "option_duration_ms")]
    pub auto_invalidation_delay: Option<Duration>,

    /// 非暫時性錯誤的存活時間（應短於值的存活時間）
    #[serde(with = "duration_ms")]
    pub error_auto_invalidation_delay: Duration,

    /// 暫時性錯誤的存活時間
    #[serde(with = "duration_ms")]
    pub transient_error_invalidation_delay: Duration,

    /// 失效延遲：非立即的失效會延後這段時間才生效
    #[serde(with = "option_duration_ms")]
    pub invalidation_delay: Option<Duration>,
}

impl ComputedOptions {
    /// 創建預設選項
    pub fn new() -> Self {
        Self {
            min_cache_duration: Some(Duration::from_secs(60)),
            auto_invalidation_delay: None,
            error_auto_invalidation_delay: Duration::from_secs(10),
            transient_error_invalidation_delay: Duration::from_secs(1),
            invalidation_delay: None,
        }
    }

    /// 建構器模式：設置最短快取時間（`None` 表示不保持存活）
    pub fn with_min_cache_duration(mut self, duration: Option<Duration>) -> Self {
        self.min_cache_duration = duration;
        self
    }

    /// 建構器模式：設置自動失效延遲
    pub fn with_auto_invalidation_delay(mut self, delay: Duration) -> Self {
        self.auto_invalidation_delay = Some(delay);
        self
    }

    /// 建構器模式：設置錯誤存活時間
    pub fn with_error_auto_invalidation_delay(mut self, delay: Duration) -> Self {
        self.error_auto_invalidation_delay = delay;
        self
    }

    /// 建構器模式：設置暫時性錯誤存活時間
    pub fn with_transient_error_invalidation_delay(mut self, delay: Duration) -> Self {
        self.transient_error_invalidation_delay = delay;
        self
    }

    /// 建構器模式：設置失效延遲
    pub fn with_invalidation_delay(mut self, delay: Duration) -> Self {
        self.invalidation_delay = Some(delay);
        self
    }

    /// 錯誤結果的存活時間
    ///
    /// 錯誤不會比值活得更久。
    pub fn error_lifetime(&self, is_transient: bool) -> Duration {
        let delay = if is_transient {
            self.transient_error_invalidation_delay
        } else {
            self.error_auto_invalidation_delay
        };
        match self.auto_invalidation_delay {
            Some(value_delay) => delay.min(value_delay),
            None => delay,
        }
    }
}

impl Default for ComputedOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// 計算圖配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// 計時器刻度（排程器的時間解析度）
    #[serde(with = "duration_ms")]
    pub tick_resolution: Duration,

    /// 計時器分片數量
    pub timer_concurrency: usize,

    /// 精確失效延遲門檻：低於此值的失效延遲使用獨立的精確計時
    #[serde(with = "duration_ms")]
    pub precise_invalidation_delay_threshold: Duration,

    /// 反向邊修剪週期
    #[serde(with = "duration_ms")]
    pub prune_interval: Duration,

    /// 預設節點選項
    pub default_options: ComputedOptions,
}

impl FusionConfig {
    /// 創建預設配置
    pub fn new() -> Self {
        let timer_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            tick_resolution: Duration::from_millis(250),
            timer_concurrency,
            precise_invalidation_delay_threshold: Duration::from_secs(1),
            prune_interval: Duration::from_secs(60),
            default_options: ComputedOptions::new(),
        }
    }

    /// 從 JSON 讀取配置
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 建構器模式：設置計時器刻度
    pub fn with_tick_resolution(mut self, tick: Duration) -> Self {
        self.tick_resolution = tick;
        self
    }

    /// 建構器模式：設置計時器分片數量
    pub fn with_timer_concurrency(mut self, concurrency: usize) -> Self {
        self.timer_concurrency = concurrency.max(1);
        self
    }

    /// 建構器模式：設置精確失效延遲門檻
    pub fn with_precise_invalidation_delay_threshold(mut self, threshold: Duration) -> Self {
        self.precise_invalidation_delay_threshold = threshold;
        self
    }

    /// 建構器模式：設置修剪週期
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// 建構器模式：設置預設節點選項
    pub fn with_default_options(mut self, options: ComputedOptions) -> Self {
        self.default_options = options;
        self
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 以毫秒序列化 `Duration`
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// 以毫秒序列化 `Option<Duration>`
pub mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
