//! 失效日誌處理
//!
//! 從已提交的日誌讀取項目並交給 [`LogEntryProcessor`]。
//! 索引不連續時（例如複寫延遲造成的缺口），為每個缺少的索引啟動一個重試任務；
//! 重試用盡後記錄錯誤並放棄該索引，不阻擋後續項目。
//! 失效是冪等的，所以同一項目被處理多次是安全的。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use fusion_core::config::duration_ms;
use fusion_core::{ComputedInput, FusionError, Result};
use fusion_graph::ComputedGraph;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commander::Commander;
use crate::retry::{RetryDelaySeq, RetryPolicy};

/// 日誌項目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub logged_at: DateTime<Utc>,
    pub payload: Value,
}

/// 日誌來源
#[async_trait]
pub trait LogReader: Send + Sync {
    /// `since` 之後的第一個項目
    async fn first_entry_since(&self, since: DateTime<Utc>) -> Result<Option<LogEntry>>;

    /// 從 `index` 起依序讀取最多 `limit` 個項目
    async fn read_from(&self, index: u64, limit: usize) -> Result<Vec<LogEntry>>;

    /// 讀取單一項目
    async fn read_entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// 等待日誌變更；預設永不完成，只依賴定期檢查
    async fn when_changed(&self) {
        futures::future::pending::<()>().await
    }
}

#[async_trait]
pub trait LogEntryProcessor: Send + Sync {
    async fn process(&self, entry: &LogEntry) -> Result<()>;
}

/// 失效日誌的內容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationPayload {
    /// 直接列出要失效的計算輸入
    Inputs { inputs: Vec<ComputedInput> },
    /// 重播命令的失效處理
    Command { command_type: String, command: Value },
}

/// 把日誌項目轉為計算圖的失效
pub struct InvalidationLogProcessor {
    graph: ComputedGraph,
    commander: Option<Arc<Commander>>,
}

impl InvalidationLogProcessor {
    pub fn new(graph: ComputedGraph) -> Self {
        Self {
            graph,
            commander: None,
        }
    }

    /// 建構器模式：設置重播命令用的執行器
    pub fn with_commander(mut self, commander: Arc<Commander>) -> Self {
        self.commander = Some(commander);
        self
    }
}

#[async_trait]
impl LogEntryProcessor for InvalidationLogProcessor {
    async fn process(&self, entry: &LogEntry) -> Result<()> {
        let payload: InvalidationPayload = serde_json::from_value(entry.payload.clone())?;
        match payload {
            InvalidationPayload::Inputs { inputs } => {
                let invalidated = inputs
                    .iter()
                    .filter(|input| self.graph.invalidate_input(input))
                    .count();
                tracing::debug!("日誌 #{} 使 {} 個節點失效", entry.index, invalidated);
                Ok(())
            }
            InvalidationPayload::Command { command_type, command } => {
                let commander = self.commander.as_ref().ok_or_else(|| {
                    FusionError::Internal(format!("日誌 #{} 需要命令執行器", entry.index))
                })?;
                commander.invalidate_value(&command_type, command).await
            }
        }
    }
}

/// 日誌處理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogProcessorConfig {
    /// 每批讀取的項目數
    pub batch_size: usize,

    /// 沒有變更通知時的定期檢查間隔
    #[serde(with = "duration_ms")]
    pub forced_check_period: Duration,

    /// 啟動時往回讀取的時間
    #[serde(with = "duration_ms")]
    pub start_offset: Duration,

    /// 缺口首次重試前的等待
    #[serde(with = "duration_ms")]
    pub gap_retry_delay: Duration,

    /// 缺口最多重試次數
    pub gap_retry_count: u32,

    /// 缺口重試總時限
    #[serde(with = "duration_ms")]
    pub gap_retry_timeout: Duration,

    /// 缺口重試延遲序列
    pub gap_retry_delays: RetryDelaySeq,

    /// 讀取失敗後的重試延遲序列
    pub error_retry_delays: RetryDelaySeq,
}

impl LogProcessorConfig {
    pub fn new() -> Self {
        Self {
            batch_size: 128,
            forced_check_period: Duration::from_secs(5),
            start_offset: Duration::from_secs(3),
            gap_retry_delay: Duration::from_millis(100),
            gap_retry_count: 10,
            gap_retry_timeout: Duration::from_secs(30),
            gap_retry_delays: RetryDelaySeq::exp(Duration::from_millis(250), Duration::from_secs(1)),
            error_retry_delays: RetryDelaySeq::exp(Duration::from_secs(1), Duration::from_secs(5)),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 建構器模式：設置批次大小
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// 建構器模式：設置定期檢查間隔
    pub fn with_forced_check_period(mut self, period: Duration) -> Self {
        self.forced_check_period = period;
        self
    }

    /// 建構器模式：設置啟動回溯時間
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    /// 建構器模式：設置缺口重試
    pub fn with_gap_retry(mut self, count: u32, timeout: Duration, delays: RetryDelaySeq) -> Self {
        self.gap_retry_count = count;
        self.gap_retry_timeout = timeout;
        self.gap_retry_delays = delays;
        self
    }

    /// 缺口重試策略
    pub fn gap_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Some(self.gap_retry_count),
            Some(self.gap_retry_timeout),
            self.gap_retry_delays.clone(),
        )
    }
}

impl Default for LogProcessorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 日誌處理迴圈
pub struct LogProcessingLoop {
    reader: Arc<dyn LogReader>,
    processor: Arc<dyn LogEntryProcessor>,
    config: LogProcessorConfig,
    gap_policy: RetryPolicy,
    next_index: Mutex<Option<u64>>,
    gap_tasks: DashSet<u64>,
    cancel: CancellationToken,
}

impl LogProcessingLoop {
    pub fn new(
        reader: Arc<dyn LogReader>,
        processor: Arc<dyn LogEntryProcessor>,
        config: LogProcessorConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let gap_policy = config.gap_retry_policy();
        Arc::new(Self {
            reader,
            processor,
            config,
            gap_policy,
            next_index: Mutex::new(None),
            gap_tasks: DashSet::new(),
            cancel,
        })
    }

    /// 下一個要讀取的索引
    pub fn next_index(&self) -> Option<u64> {
        *self.next_index.lock()
    }

    /// 進行中的缺口任務數
    pub fn gap_count(&self) -> usize {
        self.gap_tasks.len()
    }

    /// 啟動背景處理
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// 處理迴圈：處理所有新項目，然後等待變更或定期檢查
    pub async fn run(self: Arc<Self>) {
        tracing::info!("日誌處理開始");
        let mut failures = 0;
        loop {
            let delay = match self.process_new_entries().await {
                Ok(()) => {
                    failures = 0;
                    self.config.forced_check_period
                }
                Err(e) => {
                    let delay = self.config.error_retry_delays.delay(failures);
                    failures += 1;
                    tracing::warn!("日誌讀取失敗，{:?} 後重試: {}", delay, e);
                    delay
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.reader.when_changed(), if failures == 0 => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("日誌處理已停止");
    }

    /// 分批處理直到沒有新項目
    pub async fn process_new_entries(self: &Arc<Self>) -> Result<()> {
        while self.process_batch().await? {}
        Ok(())
    }

    /// 處理一批，回傳是否可能還有更多項目
    pub async fn process_batch(self: &Arc<Self>) -> Result<bool> {
        let Some(mut next_index) = self.try_get_next_index().await? else {
            return Ok(false);
        };

        let batch_size = self.config.batch_size;
        let entries = self.reader.read_from(next_index, batch_size).await?;
        if entries.len() == batch_size {
            tracing::warn!("讀到滿批 {} 個項目（從 #{} 起）", entries.len(), next_index);
        } else {
            tracing::debug!("讀到 {} 個項目（從 #{} 起）", entries.len(), next_index);
        }
        if entries.is_empty() {
            return Ok(false);
        }

        for entry in &entries {
            while next_index < entry.index {
                self.spawn_gap(next_index);
                next_index += 1;
            }
            self.process_safe(entry, true).await;
            next_index = entry.index + 1;
        }

        *self.next_index.lock() = Some(next_index);
        Ok(entries.len() >= batch_size)
    }

    async fn try_get_next_index(&self) -> Result<Option<u64>> {
        if let Some(index) = self.next_index() {
            return Ok(Some(index));
        }

        let offset = chrono::Duration::from_std(self.config.start_offset).unwrap_or_else(|_| chrono::Duration::zero());
        let Some(start) = self.reader.first_entry_since(Utc::now() - offset).await? else {
            return Ok(None);
        };

        let mut next_index = self.next_index.lock();
        let index = *next_index.get_or_insert(start.index);
        tracing::info!("從日誌 #{} 開始處理", index);
        Ok(Some(index))
    }

    async fn process_safe(self: &Arc<Self>, entry: &LogEntry, fallback_to_gap: bool) {
        if let Err(e) = self.processor.process(entry).await {
            if fallback_to_gap {
                tracing::error!("處理日誌 #{} 失敗，將以缺口重新處理: {}", entry.index, e);
                self.spawn_gap(entry.index);
            } else {
                tracing::error!("處理日誌 #{} 失敗: {}", entry.index, e);
            }
        }
    }

    /// 為缺少的索引啟動重試任務（同一索引只會有一個）
    fn spawn_gap(self: &Arc<Self>, index: u64) {
        if !self.gap_tasks.insert(index) {
            return;
        }
        tracing::debug!("日誌 #{} 缺少，啟動缺口任務", index);

        let this = self.clone();
        tokio::spawn(async move {
            this.process_gap(index).await;
            this.gap_tasks.remove(&index);
        });
    }

    async fn process_gap(self: &Arc<Self>, index: u64) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.gap_retry_delay) => {}
        }

        let result = self
            .gap_policy
            .apply(&self.cancel, |_| {
                let reader = self.reader.clone();
                async move {
                    match reader.read_entry(index).await? {
                        Some(entry) => Ok(entry),
                        None => Err(FusionError::LogEntryNotFound(index)),
                    }
                }
            })
            .await;

        match result {
            Ok(entry) => {
                self.process_safe(&entry, false).await;
                tracing::info!("缺口日誌 #{} 已處理", index);
            }
            Err(FusionError::Cancelled) => {}
            Err(e) => tracing::error!("放棄缺口日誌 #{}: {}", index, e),
        }
    }
}

/// 記憶體日誌
#[derive(Default)]
pub struct InMemoryLog {
    entries: RwLock<BTreeMap<u64, LogEntry>>,
    changed: Notify,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在最後一個索引之後追加
    pub fn append(&self, payload: Value) -> u64 {
        let mut entries = self.entries.write();
        let index = entries.keys().next_back().map_or(1, |last| last + 1);
        entries.insert(
            index,
            LogEntry {
                index,
                logged_at: Utc::now(),
                payload,
            },
        );
        drop(entries);
        self.changed.notify_one();
        index
    }

    /// 在指定索引寫入（模擬延遲可見的項目）
    pub fn insert_at(&self, index: u64, payload: Value) {
        self.entries.write().insert(
            index,
            LogEntry {
                index,
                logged_at: Utc::now(),
                payload,
            },
        );
        self.changed.notify_one();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl LogReader for InMemoryLog {
    async fn first_entry_since(&self, since: DateTime<Utc>) -> Result<Option<LogEntry>> {
        Ok(self
            .entries
            .read()
            .values()
            .find(|entry| entry.logged_at >= since)
            .cloned())
    }

    async fn read_from(&self, index: u64, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries
            .read()
            .range(index..)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn read_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.entries.read().get(&index).cloned())
    }

    async fn when_changed(&self) {
        self.changed.notified().await
    }
}
