use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Result, StratumError, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct LruKNode {
    /// History of access timestamps (most recent at back), at most k entries
    history: VecDeque<Timestamp>,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl LruKNode {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    /// Records an access at the given timestamp, keeping only the last k.
    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Returns the backward k-distance from the current timestamp.
    /// None means fewer than k recorded accesses (+inf distance).
    fn k_distance(&self, current_timestamp: Timestamp, k: usize) -> Option<Timestamp> {
        if self.history.len() < k {
            None
        } else {
            Some(current_timestamp - self.history[self.history.len() - k])
        }
    }

    /// Returns the earliest recorded timestamp in the history.
    fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.history.front().copied()
    }
}

/// State behind the replacer's single exclusive latch.
struct ReplacerState {
    /// Access information for each tracked frame
    nodes: HashMap<FrameId, LruKNode>,
    /// Number of evictable frames
    num_evictable: usize,
    /// Logical clock, bumped on every recorded access
    current_timestamp: Timestamp,
}

/// LRU-K Replacement Policy
///
/// The LRU-K algorithm evicts the frame whose backward k-distance is the
/// maximum over all evictable frames. Backward k-distance is the difference
/// between the current timestamp and the timestamp of the k-th previous
/// access.
///
/// A frame with fewer than k historical accesses has +inf backward
/// k-distance. Among frames with +inf distance, the replacer evicts the one
/// with the earliest recorded access (classical LRU fallback).
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    /// All mutable state, behind one latch
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum frame
    /// count.
    pub fn new(k: usize, max_frames: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            max_frames,
            state: Mutex::new(ReplacerState {
                nodes: HashMap::new(),
                num_evictable: 0,
                current_timestamp: 0,
            }),
        }
    }

    /// Evicts the frame with the largest backward k-distance.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        if state.num_evictable == 0 {
            return None;
        }

        let current_ts = state.current_timestamp;

        let mut victim: Option<FrameId> = None;
        let mut victim_k_dist: Option<Timestamp> = None;
        let mut victim_earliest_ts: Option<Timestamp> = None;

        for (frame_id, node) in state.nodes.iter() {
            if !node.is_evictable {
                continue;
            }

            let k_dist = node.k_distance(current_ts, self.k);
            let earliest_ts = node.earliest_timestamp();

            let should_replace = match (victim_k_dist, k_dist) {
                // Current victim has +inf, candidate has finite -> keep victim
                (None, Some(_)) => false,
                // Current victim has finite, candidate has +inf -> replace
                (Some(_), None) => true,
                // Both +inf -> earlier first access wins
                (None, None) => match (victim_earliest_ts, earliest_ts) {
                    (Some(v_ts), Some(c_ts)) => c_ts < v_ts,
                    (None, Some(_)) => true,
                    _ => false,
                },
                // Both finite -> larger k-distance wins
                (Some(v_dist), Some(c_dist)) => c_dist > v_dist,
            };

            if victim.is_none() || should_replace {
                victim = Some(*frame_id);
                victim_k_dist = k_dist;
                victim_earliest_ts = earliest_ts;
            }
        }

        if let Some(frame_id) = victim {
            state.nodes.remove(&frame_id);
            state.num_evictable -= 1;
        }

        victim
    }

    /// Records that the given frame was accessed now.
    /// Creates the tracking node on the first access.
    pub fn record_access(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut state = self.state.lock();
        let timestamp = state.current_timestamp;
        state.current_timestamp += 1;

        state
            .nodes
            .entry(frame_id)
            .or_insert_with(LruKNode::new)
            .record_access(timestamp, self.k);
    }

    /// Sets whether a frame is evictable. The evictable count changes only
    /// when the flag actually flips.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(node) = state.nodes.get_mut(&frame_id) {
            if node.is_evictable != is_evictable {
                node.is_evictable = is_evictable;
                if is_evictable {
                    state.num_evictable += 1;
                } else {
                    state.num_evictable -= 1;
                }
            }
        } else if is_evictable {
            // Frame has no recorded history yet but is being marked evictable
            let mut node = LruKNode::new();
            node.is_evictable = true;
            state.nodes.insert(frame_id, node);
            state.num_evictable += 1;
        }
    }

    /// Removes a frame from the replacer entirely.
    /// Removing a non-evictable frame is a precondition violation.
    pub fn remove(&self, frame_id: FrameId) -> Result<()> {
        let mut state = self.state.lock();

        let is_evictable = match state.nodes.get(&frame_id) {
            Some(node) => node.is_evictable,
            None => return Ok(()),
        };
        if !is_evictable {
            return Err(StratumError::FrameNotEvictable(frame_id));
        }

        state.nodes.remove(&frame_id);
        state.num_evictable -= 1;
        Ok(())
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().num_evictable
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_new() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
    }

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_basic() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(2));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);
        replacer.set_evictable(FrameId::new(2), true);

        assert_eq!(replacer.size(), 3);

        // All have a single access (< k=2), so all have +inf distance.
        // The one with the earliest timestamp goes first.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_lru_k_replacer_k_distance() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));

        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 1 has only one access, so its +inf distance wins
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    }

    #[test]
    fn test_lru_k_replacer_not_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_remove() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);

        assert_eq!(replacer.size(), 1);

        replacer.remove(FrameId::new(0)).unwrap();

        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_remove_non_evictable_fails() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));

        let result = replacer.remove(FrameId::new(0));
        assert!(matches!(result, Err(StratumError::FrameNotEvictable(_))));

        // State is unchanged, the frame can still be evicted later
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_remove_unknown_frame_is_noop() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.remove(FrameId::new(7)).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // Redundant toggles must not skew the count
        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_largest_k_distance() {
        let replacer = LruKReplacer::new(2, 10);

        // Frame 0: t=0, t=1; frame 1: t=2, t=3; frame 2: t=4, t=5
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(2));
        replacer.record_access(FrameId::new(2));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);
        replacer.set_evictable(FrameId::new(2), true);

        // Frame 0's 2nd-most-recent access is oldest -> largest k-distance
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }
}
