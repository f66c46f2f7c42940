//! 客戶端快取
//!
//! 保存每個 [`RpcCacheKey`] 最後一次已知的回應位元組。
//! 寫入先排入佇列，批次寫入底層儲存；讀取先看佇列再看儲存。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::cache_key::RpcCacheKey;

/// 一批待寫入的變更：`None` 表示移除
pub type CacheBatch = HashMap<RpcCacheKey, Option<Bytes>>;

/// 客戶端計算快取
pub trait ClientComputedCache: Send + Sync {
    fn get(&self, key: &RpcCacheKey) -> Option<Bytes>;
    fn set(&self, key: RpcCacheKey, data: Bytes);
    fn remove(&self, key: RpcCacheKey);
    /// 立即寫入所有排隊中的變更
    fn flush(&self);
    /// 寫入排隊中的變更後清空全部
    fn clear(&self);
}

/// 快取的底層儲存
pub trait CacheStore: Send + Sync + 'static {
    fn fetch(&self, key: &RpcCacheKey) -> Option<Bytes>;
    /// 原子地套用一批變更
    fn apply_batch(&self, batch: &CacheBatch);
    fn clear(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 記憶體儲存
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<RpcCacheKey, Bytes>,
    // 批次寫入閘門：套用批次時不讓讀取看到一半的結果
    gate: RwLock<()>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn fetch(&self, key: &RpcCacheKey) -> Option<Bytes> {
        let _read = self.gate.read();
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn apply_batch(&self, batch: &CacheBatch) {
        let _write = self.gate.write();
        for (key, data) in batch {
            match data {
                Some(data) => {
                    self.entries.insert(key.clone(), data.clone());
                }
                None => {
                    self.entries.remove(key);
                }
            }
        }
    }

    fn clear(&self) {
        let _write = self.gate.write();
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct FlushState<S> {
    store: Arc<S>,
    pending: Mutex<CacheBatch>,
    in_flight: Mutex<CacheBatch>,
    flushing: Mutex<()>,
    flush_scheduled: AtomicBool,
    flush_delay: Duration,
}

impl<S: CacheStore> FlushState<S> {
    fn get(&self, key: &RpcCacheKey) -> Option<Bytes> {
        if let Some(data) = self.pending.lock().get(key) {
            return data.clone();
        }
        if let Some(data) = self.in_flight.lock().get(key) {
            return data.clone();
        }
        self.store.fetch(key)
    }

    fn flush(&self) {
        let _flushing = self.flushing.lock();
        self.flush_scheduled.store(false, Ordering::Release);

        let batch = {
            let mut pending = self.pending.lock();
            let batch = std::mem::take(&mut *pending);
            *self.in_flight.lock() = batch.clone();
            batch
        };
        if batch.is_empty() {
            return;
        }
        self.store.apply_batch(&batch);
        self.in_flight.lock().clear();
        tracing::debug!("客戶端快取寫入 {} 筆變更", batch.len());
    }
}

/// 批次寫入的客戶端快取
///
/// 第一筆寫入會排程一次延遲寫入（需在 tokio 執行環境內）；沒有執行環境時只能手動 [`flush`](ClientComputedCache::flush)。
pub struct FlushingClientComputedCache<S: CacheStore = InMemoryCacheStore> {
    state: Arc<FlushState<S>>,
}

impl<S: CacheStore> FlushingClientComputedCache<S> {
    pub fn new(store: Arc<S>, flush_delay: Duration) -> Self {
        Self {
            state: Arc::new(FlushState {
                store,
                pending: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                flushing: Mutex::new(()),
                flush_scheduled: AtomicBool::new(false),
                flush_delay,
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.state.store
    }

    /// 排隊中的變更數量
    pub fn pending_count(&self) -> usize {
        self.state.pending.lock().len()
    }

    fn enqueue(&self, key: RpcCacheKey, data: Option<Bytes>) {
        self.state.pending.lock().insert(key, data);
        if self.state.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.state.flush_scheduled.store(false, Ordering::Release);
            return;
        };
        let state: Weak<FlushState<S>> = Arc::downgrade(&self.state);
        let delay = self.state.flush_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(state) = state.upgrade() {
                state.flush();
            }
        });
    }
}

impl FlushingClientComputedCache<InMemoryCacheStore> {
    /// 以記憶體儲存創建
    pub fn in_memory(flush_delay: Duration) -> Self {
        Self::new(Arc::new(InMemoryCacheStore::new()), flush_delay)
    }
}

impl<S: CacheStore> ClientComputedCache for FlushingClientComputedCache<S> {
    fn get(&self, key: &RpcCacheKey) -> Option<Bytes> {
        self.state.get(key)
    }

    fn set(&self, key: RpcCacheKey, data: Bytes) {
        self.enqueue(key, Some(data));
    }

    fn remove(&self, key: RpcCacheKey) {
        self.enqueue(key, None);
    }

    fn flush(&self) {
        self.state.flush();
    }

    fn clear(&self) {
        self.state.flush();
        self.state.store.clear();
        tracing::debug!("客戶端快取已清空");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RpcMethodDef;
    use fusion_core::ArgumentList;

    fn key(id: &str) -> RpcCacheKey {
        RpcCacheKey::new(
            &RpcMethodDef::new("todo", "get"),
            &ArgumentList::new().with(id).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_set_flush_fetch() {
        let cache = FlushingClientComputedCache::in_memory(Duration::from_millis(100));
        cache.set(key("a"), Bytes::from_static(b"1"));

        // 排隊中的寫入可立即讀到
        assert_eq!(cache.get(&key("a")), Some(Bytes::from_static(b"1")));
        assert!(cache.store().is_empty());
        assert_eq!(cache.pending_count(), 1);

        cache.flush();
        assert_eq!(cache.store().fetch(&key("a")), Some(Bytes::from_static(b"1")));
        assert_eq!(cache.get(&key("a")), Some(Bytes::from_static(b"1")));
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_remove_flush_misses() {
        let cache = FlushingClientComputedCache::in_memory(Duration::from_millis(100));
        cache.set(key("a"), Bytes::from_static(b"1"));
        cache.flush();

        cache.remove(key("a"));
        assert_eq!(cache.get(&key("a")), None);
        cache.flush();
        assert_eq!(cache.get(&key("a")), None);
        assert!(cache.store().is_empty());
    }

    #[test]
    fn test_last_write_wins_within_batch() {
        let cache = FlushingClientComputedCache::in_memory(Duration::from_millis(100));
        cache.set(key("a"), Bytes::from_static(b"1"));
        cache.set(key("a"), Bytes::from_static(b"2"));
        cache.flush();
        assert_eq!(cache.get(&key("a")), Some(Bytes::from_static(b"2")));
        assert_eq!(cache.store().len(), 1);
    }

    #[test]
    fn test_clear_flushes_then_drops_everything() {
        let cache = FlushingClientComputedCache::in_memory(Duration::from_millis(100));
        cache.set(key("a"), Bytes::from_static(b"1"));
        cache.flush();
        cache.set(key("b"), Bytes::from_static(b"2"));

        cache.clear();
        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_flush_after_first_write() {
        let cache = FlushingClientComputedCache::in_memory(Duration::from_millis(100));
        cache.set(key("a"), Bytes::from_static(b"1"));
        cache.set(key("b"), Bytes::from_static(b"2"));
        assert!(cache.store().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.store().len(), 2);
        assert_eq!(cache.pending_count(), 0);

        // 下一次寫入重新排程
        cache.remove(key("a"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.store().len(), 1);
    }
}
