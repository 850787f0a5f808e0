use super::replacer::{FrameId, Replacer};
use std::collections::{HashSet, VecDeque};

/// Least-recently-used replacement: frames are evicted in the order they
/// became evictable.
#[derive(Debug)]
pub struct LruReplacer {
    /// Queue of evictable frames (least recently unpinned at front).
    lru_list: VecDeque<FrameId>,
    /// Membership set for O(1) duplicate checks.
    lru_set: HashSet<FrameId>,
    /// Maximum number of evictable frames.
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: VecDeque::with_capacity(max_size),
            lru_set: HashSet::with_capacity(max_size),
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        let frame_id = self.lru_list.pop_front()?;
        self.lru_set.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if self.lru_set.remove(&frame_id) {
            self.lru_list.retain(|&f| f != frame_id);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.lru_set.contains(&frame_id) || self.lru_list.len() >= self.max_size {
            return;
        }
        self.lru_list.push_back(frame_id);
        self.lru_set.insert(frame_id);
    }

    fn size(&self) -> usize {
        self.lru_list.len()
    }
}
