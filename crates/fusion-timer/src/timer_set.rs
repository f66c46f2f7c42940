//! 並行計時器集合
//!
//! 項目依雜湊分散到多個分片，每個分片各自加鎖，
//! 分片內以刻度分桶。背景驅動器每個刻度呼叫一次 [`ConcurrentTimerSet::fire_due`]，
//! 觸發回呼在鎖外執行。

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fusion_core::clock::{default_clock, MomentClock};
use fusion_core::FusionConfig;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bucketing::TickBucketer;

/// 計時器集合選項
#[derive(Debug, Clone)]
pub struct TimerSetOptions {
    /// 刻度（時間解析度）
    pub tick: Duration,
    /// 分片數量
    pub concurrency: usize,
    /// 時鐘來源
    pub clock: Arc<dyn MomentClock>,
}

impl TimerSetOptions {
    pub fn new() -> Self {
        Self {
            tick: Duration::from_millis(250),
            concurrency: 4,
            clock: default_clock(),
        }
    }

    /// 從計算圖配置建立
    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new()
            .with_tick(config.tick_resolution)
            .with_concurrency(config.timer_concurrency)
    }

    /// 建構器模式：設置刻度
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// 建構器模式：設置分片數量
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 建構器模式：設置時鐘
    pub fn with_clock(mut self, clock: Arc<dyn MomentClock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for TimerSetOptions {
    fn default() -> Self {
        Self::new()
    }
}

type FireFn<T> = dyn Fn(T) + Send + Sync;

/// 單一分片
struct TimerShard<T> {
    buckets: BTreeMap<u64, HashSet<T>>,
    ticks: HashMap<T, u64>,
}

impl<T: Clone + Eq + Hash> TimerShard<T> {
    fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            ticks: HashMap::new(),
        }
    }

    fn tick_of(&self, item: &T) -> Option<u64> {
        self.ticks.get(item).copied()
    }

    fn detach(&mut self, item: &T, tick: u64) {
        if let Some(bucket) = self.buckets.get_mut(&tick) {
            bucket.remove(item);
            if bucket.is_empty() {
                self.buckets.remove(&tick);
            }
        }
    }

    fn upsert(&mut self, item: T, tick: u64) {
        if let Some(old) = self.ticks.insert(item.clone(), tick) {
            if old == tick {
                return;
            }
            self.detach(&item, old);
        }
        self.buckets.entry(tick).or_default().insert(item);
    }

    fn remove(&mut self, item: &T) -> bool {
        match self.ticks.remove(item) {
            Some(tick) => {
                self.detach(item, tick);
                true
            }
            None => false,
        }
    }

    /// 取出刻度 ≤ `current` 的所有項目
    fn take_due(&mut self, current: u64) -> Vec<T> {
        let later = match current.checked_add(1) {
            Some(next) => self.buckets.split_off(&next),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut self.buckets, later);
        let mut items = Vec::new();
        for bucket in due.into_values() {
            for item in bucket {
                self.ticks.remove(&item);
                items.push(item);
            }
        }
        items
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.ticks.clear();
    }
}

struct TimerSetInner<T> {
    bucketer: TickBucketer,
    clock: Arc<dyn MomentClock>,
    hasher: RandomState,
    shards: Vec<Mutex<TimerShard<T>>>,
    fire: Arc<FireFn<T>>,
    disposed: AtomicBool,
}

impl<T> TimerSetInner<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn shard(&self, item: &T) -> &Mutex<TimerShard<T>> {
        let len = self.shards.len() as u64;
        let index = self.hasher.hash_one(item) % len;
        &self.shards[index as usize]
    }

    fn fire_due(&self) -> usize {
        if self.disposed.load(Ordering::Acquire) {
            return 0;
        }
        let current = self.bucketer.current_tick(self.clock.now());
        let mut fired = 0;
        for shard in &self.shards {
            let due = shard.lock().take_due(current);
            for item in due {
                (self.fire)(item);
                fired += 1;
            }
        }
        fired
    }
}

/// 並行計時器集合
///
/// 每個項目最多只有一個到期時間，到期時呼叫一次觸發回呼後移除。
/// 觸發時間落在 `[due, due + tick)` 之內。
pub struct ConcurrentTimerSet<T> {
    inner: Arc<TimerSetInner<T>>,
    cancel: CancellationToken,
}

impl<T> ConcurrentTimerSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// 創建計時器集合並啟動背景驅動器
    ///
    /// 需要在 tokio 執行環境內呼叫；沒有執行環境時只能手動呼叫 `fire_due`。
    pub fn new(options: TimerSetOptions, fire: impl Fn(T) + Send + Sync + 'static) -> Self {
        let set = Self::new_manual(options, fire);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&set.inner);
                let bucketer = set.inner.bucketer;
                handle.spawn(drive(weak, bucketer, set.cancel.clone()));
            }
            Err(_) => {
                tracing::warn!("沒有 tokio 執行環境，計時器驅動器未啟動");
            }
        }
        set
    }

    /// 創建不含背景驅動器的計時器集合（由呼叫端呼叫 `fire_due`）
    pub fn new_manual(options: TimerSetOptions, fire: impl Fn(T) + Send + Sync + 'static) -> Self {
        let concurrency = options.concurrency.max(1);
        let origin = options.clock.now();
        let inner = TimerSetInner {
            bucketer: TickBucketer::new(origin, options.tick),
            clock: options.clock,
            hasher: RandomState::new(),
            shards: (0..concurrency).map(|_| Mutex::new(TimerShard::new())).collect(),
            fire: Arc::new(fire),
            disposed: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tick(&self) -> Duration {
        self.inner.bucketer.tick()
    }

    pub fn clock(&self) -> &Arc<dyn MomentClock> {
        &self.inner.clock
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// 新增或更新項目的到期時間
    pub fn add_or_update(&self, item: T, due: Instant) {
        if self.is_disposed() {
            return;
        }
        let tick = self.inner.bucketer.tick_of_deadline(due);
        self.inner.shard(&item).lock().upsert(item, tick);
    }

    /// 只在新的到期時間較早（或項目不存在）時更新
    pub fn add_or_update_to_earlier(&self, item: T, due: Instant) -> bool {
        self.update_if(item, due, |old, new| new < old)
    }

    /// 只在新的到期時間較晚（或項目不存在）時更新
    pub fn add_or_update_to_later(&self, item: T, due: Instant) -> bool {
        self.update_if(item, due, |old, new| new > old)
    }

    fn update_if(&self, item: T, due: Instant, accept: impl Fn(u64, u64) -> bool) -> bool {
        if self.is_disposed() {
            return false;
        }
        let tick = self.inner.bucketer.tick_of_deadline(due);
        let mut shard = self.inner.shard(&item).lock();
        if let Some(old) = shard.tick_of(&item) {
            if !accept(old, tick) {
                return false;
            }
        }
        shard.upsert(item, tick);
        true
    }

    /// 移除項目，回傳是否存在
    pub fn remove(&self, item: &T) -> bool {
        self.inner.shard(item).lock().remove(item)
    }

    /// 目前排程中的項目數量
    pub fn count(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().ticks.len()).sum()
    }

    /// 觸發所有已到期的項目，回傳觸發數量
    pub fn fire_due(&self) -> usize {
        self.inner.fire_due()
    }

    /// 停止驅動器並釋放所有項目（不觸發）
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        for shard in &self.inner.shards {
            shard.lock().clear();
        }
        tracing::debug!("計時器集合已釋放");
    }
}

impl<T> Drop for ConcurrentTimerSet<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive<T>(inner: Weak<TimerSetInner<T>>, bucketer: TickBucketer, cancel: CancellationToken)
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    let tick = bucketer.tick();
    let mut interval = tokio::time::interval_at(bucketer.origin() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let fired = inner.fire_due();
                if fired > 0 {
                    tracing::debug!("計時器觸發 {} 個項目", fired);
                }
            }
        }
    }
}
