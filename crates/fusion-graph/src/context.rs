//! 擷取範圍
//!
//! 每個邏輯執行流程持有一個 [`ComputeContext`]，明確地以參考傳遞，
//! 不使用執行緒區域變數。範圍以堆疊方式巢狀，讀取時只看最上層的框架：
//!
//! - `Compute(node)`：讀取會記錄為 `node` 的相依邊
//! - `Isolation`：讀取不記錄邊
//! - `Capture` / `CaptureExisting`：記錄讀到的節點，不記錄邊
//! - `Invalidation`：呼叫計算方法時改為使其快取失效
//!
//! 同一個上下文不可同時被多個並行讀取使用；需要並行時以 [`ComputeContext::fork`]
//! 建立同層上下文。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fusion_core::ComputedInput;
use parking_lot::Mutex;

use crate::node::Node;

pub(crate) type CaptureSlot = Arc<Mutex<Option<Arc<Node>>>>;

/// 範圍框架
#[derive(Clone)]
pub(crate) enum Frame {
    Compute(Arc<Node>),
    Isolation,
    Capture(CaptureSlot),
    CaptureExisting(CaptureSlot),
    Invalidation,
}

struct FrameEntry {
    id: u64,
    frame: Frame,
}

/// 計算上下文（擷取堆疊）
pub struct ComputeContext {
    frames: Mutex<Vec<FrameEntry>>,
    base: usize,
    next_id: AtomicU64,
}

impl ComputeContext {
    /// 創建空的上下文
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            base: 0,
            next_id: AtomicU64::new(1),
        }
    }

    /// 建立同層上下文
    ///
    /// 新上下文繼承目前的框架，讀取仍會記錄到同一個計算節點，
    /// 但之後推入的範圍互不影響。
    pub fn fork(&self) -> ComputeContext {
        let frames: Vec<FrameEntry> = self
            .frames
            .lock()
            .iter()
            .map(|entry| FrameEntry {
                id: entry.id,
                frame: entry.frame.clone(),
            })
            .collect();
        let base = frames.len();
        ComputeContext {
            frames: Mutex::new(frames),
            base,
            next_id: AtomicU64::new(self.next_id.load(Ordering::Relaxed)),
        }
    }

    /// 開始計算範圍
    pub fn begin_compute(&self, node: Arc<Node>) -> ContextScope<'_> {
        self.push(Frame::Compute(node), None)
    }

    /// 開始隔離範圍
    pub fn begin_isolation(&self) -> ContextScope<'_> {
        self.push(Frame::Isolation, None)
    }

    /// 開始擷取範圍
    pub fn begin_capture(&self) -> ContextScope<'_> {
        let slot = CaptureSlot::default();
        self.push(Frame::Capture(slot.clone()), Some(slot))
    }

    /// 開始只擷取現成節點的範圍
    pub fn begin_capture_existing(&self) -> ContextScope<'_> {
        let slot = CaptureSlot::default();
        self.push(Frame::CaptureExisting(slot.clone()), Some(slot))
    }

    /// 開始失效範圍
    pub fn begin_invalidation(&self) -> ContextScope<'_> {
        self.push(Frame::Invalidation, None)
    }

    /// 目前正在計算的節點
    pub fn current(&self) -> Option<Arc<Node>> {
        match self.top() {
            Some(Frame::Compute(node)) => Some(node),
            _ => None,
        }
    }

    /// 是否處於失效範圍
    pub fn is_invalidating(&self) -> bool {
        matches!(self.top(), Some(Frame::Invalidation))
    }

    /// 是否處於隔離範圍
    pub fn is_isolated(&self) -> bool {
        matches!(self.top(), Some(Frame::Isolation))
    }

    /// 框架深度
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub(crate) fn top(&self) -> Option<Frame> {
        self.frames.lock().last().map(|entry| entry.frame.clone())
    }

    /// 堆疊中是否已有同一輸入的計算框架
    pub(crate) fn is_computing(&self, input: &ComputedInput) -> bool {
        self.frames.lock().iter().any(|entry| match &entry.frame {
            Frame::Compute(node) => node.input() == input,
            _ => false,
        })
    }

    fn push(&self, frame: Frame, captured: Option<CaptureSlot>) -> ContextScope<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frames = self.frames.lock();
        frames.push(FrameEntry { id, frame });
        ContextScope {
            context: self,
            id,
            depth: frames.len(),
            captured,
        }
    }

    fn pop(&self, id: u64, depth: usize) {
        let mut frames = self.frames.lock();
        let in_order = frames.len() == depth
            && depth > self.base
            && frames.last().map(|entry| entry.id) == Some(id);
        if !in_order {
            drop(frames);
            if std::thread::panicking() {
                return;
            }
            panic!("擷取範圍未依順序釋放（框架 {}，深度 {}）", id, depth);
        }
        frames.pop();
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("depth", &self.depth())
            .field("base", &self.base)
            .finish()
    }
}

/// 範圍守衛，釋放時彈出框架
///
/// 必須依推入的相反順序釋放，否則直接 panic。
pub struct ContextScope<'a> {
    context: &'a ComputeContext,
    id: u64,
    depth: usize,
    captured: Option<CaptureSlot>,
}

impl ContextScope<'_> {
    /// 擷取到的節點（只有擷取範圍會有）
    pub fn captured(&self) -> Option<Arc<Node>> {
        self.captured.as_ref().and_then(|slot| slot.lock().clone())
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.context.pop(self.id, self.depth);
    }
}
