use std::num::NonZeroUsize;
use std::sync::Mutex;

use common::FrameId;
use lru::LruCache;

/// Tracks the unpinned frames in least-recently-freed order.
///
/// Entries are only ever pushed on `unpin` and removed on `pin` or
/// `victim`, so the cache's internal order is exactly insertion order and
/// `pop_lru` yields the frame that has been evictable the longest.
pub struct LruReplacer {
    inner: Mutex<LruCache<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("replacer capacity must be > 0");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Mark `frame` evictable. A frame already present keeps its position.
    pub fn unpin(&self, frame: FrameId) {
        let mut inner = self.inner.lock().expect("replacer latch poisoned");
        if !inner.contains(&frame) {
            inner.push(frame, ());
        }
    }

    /// Remove `frame` from the candidate set, if present.
    pub fn pin(&self, frame: FrameId) {
        let mut inner = self.inner.lock().expect("replacer latch poisoned");
        inner.pop(&frame);
    }

    /// Pop the oldest evictable frame.
    pub fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock().expect("replacer latch poisoned");
        inner.pop_lru().map(|(frame, ())| frame)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("replacer latch poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
