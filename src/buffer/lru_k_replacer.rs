use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

#[derive(Debug, Default)]
struct AccessHistory {
    /// Most recent access at the back, at most k entries
    timestamps: VecDeque<Timestamp>,
    evictable: bool,
}

impl AccessHistory {
    /// Eviction priority: frames with fewer than k accesses come first
    /// (infinite backward distance), ordered by their oldest access; the
    /// rest are ordered by the timestamp of their k-th most recent access.
    /// Smaller sorts first.
    fn priority(&self, k: usize) -> (bool, Timestamp) {
        let oldest = self.timestamps.front().copied().unwrap_or(0);
        (self.timestamps.len() >= k, oldest)
    }
}

struct ReplacerState {
    /// Indexed by frame id; `None` for frames the replacer is not tracking
    frames: Vec<Option<AccessHistory>>,
    clock: Timestamp,
    evictable: usize,
}

/// LRU-K replacement policy.
///
/// Evicts the evictable frame with the largest backward k-distance, i.e. the
/// frame whose k-th most recent access is oldest. Frames with fewer than k
/// recorded accesses have infinite distance and are evicted first, oldest
/// access first.
pub struct LruKReplacer {
    k: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    pub fn new(k: usize, max_frames: usize) -> Self {
        Self {
            k,
            state: Mutex::new(ReplacerState {
                frames: (0..max_frames).map(|_| None).collect(),
                clock: 0,
                evictable: 0,
            }),
        }
    }

    /// Picks a victim and stops tracking it.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        if state.evictable == 0 {
            return None;
        }

        let k = self.k;
        let victim = state
            .frames
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|h| (idx, h)))
            .filter(|(_, history)| history.evictable)
            .min_by_key(|(_, history)| history.priority(k))
            .map(|(idx, _)| idx)?;

        state.frames[victim] = None;
        state.evictable -= 1;
        Some(FrameId::new(victim as u32))
    }

    /// Records an access to `frame_id` at the current logical time.
    pub fn record_access(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let now = state.clock;
        state.clock += 1;

        let k = self.k;
        if let Some(slot) = state.frames.get_mut(frame_id.as_usize()) {
            let history = slot.get_or_insert_with(AccessHistory::default);
            history.timestamps.push_back(now);
            while history.timestamps.len() > k {
                history.timestamps.pop_front();
            }
        }
    }

    /// Marks whether `frame_id` may be chosen as a victim. Untracked frames
    /// marked evictable start tracking with an empty history.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = self.state.lock();
        let Some(slot) = state.frames.get_mut(frame_id.as_usize()) else {
            return;
        };

        let delta: isize = if let Some(history) = slot.as_mut() {
            if history.evictable == evictable {
                return;
            }
            history.evictable = evictable;
            if evictable {
                1
            } else {
                -1
            }
        } else if evictable {
            *slot = Some(AccessHistory {
                timestamps: VecDeque::new(),
                evictable: true,
            });
            1
        } else {
            return;
        };
        state.evictable = state.evictable.saturating_add_signed(delta);
    }

    /// Stops tracking a frame whose page left the pool.
    pub fn remove(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let removed = state
            .frames
            .get_mut(frame_id.as_usize())
            .and_then(|slot| slot.take());
        if let Some(history) = removed {
            if history.evictable {
                state.evictable -= 1;
            }
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().evictable
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(replacer: &LruKReplacer, frame: u32, times: usize) {
        for _ in 0..times {
            replacer.record_access(FrameId::new(frame));
        }
    }

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_infinite_distance_first() {
        let replacer = LruKReplacer::new(2, 10);

        touch(&replacer, 0, 2);
        touch(&replacer, 1, 1);
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        touch(&replacer, 3, 1);
        replacer.set_evictable(FrameId::new(3), true);
        replacer.set_evictable(FrameId::new(3), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(3), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.remove(FrameId::new(3));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_replacer_ignores_out_of_range_frames() {
        let replacer = LruKReplacer::new(2, 2);
        touch(&replacer, 7, 1);
        replacer.set_evictable(FrameId::new(7), true);
        assert_eq!(replacer.size(), 0);
    }
}
