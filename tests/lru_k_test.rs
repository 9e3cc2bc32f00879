//! Integration tests for the LRU-K replacer

use std::sync::Arc;
use std::thread;

use arbor::buffer::LruKReplacer;
use arbor::common::FrameId;

fn touch(replacer: &LruKReplacer, frame: u32) {
    replacer.record_access(FrameId::new(frame));
}

#[test]
fn test_lru_k_cold_frames_go_first() {
    let replacer = LruKReplacer::new(2, 8);

    // Frames 0 and 1 are hot, frame 2 was seen once
    for frame in [0, 1, 0, 1, 2] {
        touch(&replacer, frame);
    }
    for frame in 0..3 {
        replacer.set_evictable(FrameId::new(frame), true);
    }

    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_scan_does_not_flush_hot_set() {
    let replacer = LruKReplacer::new(2, 16);

    // A hot working set touched repeatedly
    for _ in 0..3 {
        for frame in 0..4 {
            touch(&replacer, frame);
        }
    }
    // A sequential scan touching each page once
    for frame in 4..12 {
        touch(&replacer, frame);
    }
    for frame in 0..12 {
        replacer.set_evictable(FrameId::new(frame), true);
    }

    // Every scanned frame leaves before any hot one
    for expected in 4..12 {
        assert_eq!(replacer.evict(), Some(FrameId::new(expected)));
    }
    assert_eq!(replacer.size(), 4);
}

#[test]
fn test_lru_k_pin_cycle() {
    let replacer = LruKReplacer::new(2, 4);

    // Pinning marks a frame non-evictable, unpinning re-enables it
    touch(&replacer, 0);
    replacer.set_evictable(FrameId::new(0), false);
    touch(&replacer, 1);
    replacer.set_evictable(FrameId::new(1), true);

    assert_eq!(replacer.size(), 1);
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), None);

    replacer.set_evictable(FrameId::new(0), true);
    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
}

#[test]
fn test_lru_k_remove_forgets_history() {
    let replacer = LruKReplacer::new(2, 4);

    for frame in [0, 0, 1] {
        touch(&replacer, frame);
    }
    replacer.set_evictable(FrameId::new(0), true);
    replacer.set_evictable(FrameId::new(1), true);
    replacer.remove(FrameId::new(1));
    assert_eq!(replacer.size(), 1);

    // Frame 1 comes back with a fresh single access
    touch(&replacer, 1);
    replacer.set_evictable(FrameId::new(1), true);
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
}

#[test]
fn test_lru_k_ignores_out_of_range_frames() {
    let replacer = LruKReplacer::new(2, 2);

    touch(&replacer, 7);
    replacer.set_evictable(FrameId::new(7), true);
    assert_eq!(replacer.size(), 0);
    assert_eq!(replacer.k(), 2);
}

#[test]
fn test_lru_k_concurrent_access() {
    let replacer = Arc::new(LruKReplacer::new(2, 64));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let replacer = Arc::clone(&replacer);
            thread::spawn(move || {
                for i in 0..16u32 {
                    let frame_id = FrameId::new(t * 16 + i);
                    replacer.record_access(frame_id);
                    replacer.set_evictable(frame_id, true);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(replacer.size(), 64);
    let mut evicted: Vec<_> = (0..64).map(|_| replacer.evict().unwrap().as_u32()).collect();
    evicted.sort_unstable();
    assert_eq!(evicted, (0..64).collect::<Vec<_>>());
    assert_eq!(replacer.evict(), None);
}
