//! Clock page replacement for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Clock replacement algorithm.
///
/// Tracks which frames hold resident pages and sweeps a clock hand over
/// them when a victim is needed. A recently accessed frame gets a second
/// chance via its reference bit; whether a frame may actually be evicted
/// (pin count zero) is decided by the caller-supplied predicate.
pub struct ClockReplacer {
    num_frames: usize,
    /// Reference bits, one per frame.
    reference_bits: Vec<AtomicBool>,
    inner: Mutex<ClockState>,
}

struct ClockState {
    /// Frames currently holding a resident page.
    resident: HashSet<FrameId>,
    /// Clock hand position.
    hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer for the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            reference_bits: (0..num_frames).map(|_| AtomicBool::new(false)).collect(),
            inner: Mutex::new(ClockState {
                resident: HashSet::new(),
                hand: 0,
            }),
        }
    }

    /// Registers a frame as holding a resident page.
    pub fn insert(&self, frame_id: FrameId) {
        if (frame_id.0 as usize) < self.num_frames {
            self.inner.lock().resident.insert(frame_id);
        }
    }

    /// Records an access, granting the frame a second chance.
    #[inline]
    pub fn record_access(&self, frame_id: FrameId) {
        if let Some(bit) = self.reference_bits.get(frame_id.0 as usize) {
            bit.store(true, Ordering::Relaxed);
        }
    }

    /// Removes a frame from replacement consideration.
    pub fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.inner.lock().resident.remove(&frame_id);
            self.reference_bits[idx].store(false, Ordering::Relaxed);
        }
    }

    /// Returns the number of frames under replacement consideration.
    pub fn len(&self) -> usize {
        self.inner.lock().resident.len()
    }

    /// Returns true if no frames are under consideration.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selects a victim frame for eviction.
    ///
    /// `can_evict` decides whether a candidate is actually evictable
    /// (typically: pin count is zero). The chosen victim is removed from
    /// the resident set; the caller takes over the frame.
    pub fn evict<F>(&self, can_evict: F) -> Option<FrameId>
    where
        F: Fn(FrameId) -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.resident.is_empty() {
            return None;
        }

        // Two full rotations: the first clears reference bits, the second
        // must then find any evictable frame.
        for _ in 0..(2 * self.num_frames) {
            let hand = inner.hand;
            inner.hand = (hand + 1) % self.num_frames;

            let frame_id = FrameId(hand as u32);
            if !inner.resident.contains(&frame_id) || !can_evict(frame_id) {
                continue;
            }
            if self.reference_bits[hand].swap(false, Ordering::Relaxed) {
                continue;
            }
            inner.resident.remove(&frame_id);
            return Some(frame_id);
        }

        None
    }
}
