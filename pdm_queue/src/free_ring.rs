//! The bounded ring of free backing-store slot indices. Multiple producers
//! pop concurrently (one per `alloc_and_insert`); the single consumer
//! thread is the sole pusher, during `flush`.
//!
//! Sized `capacity + 1` so `head == tail` is unambiguously "empty" and
//! never collides with "full" (§3: "a small slack to avoid a full/empty
//! ambiguity").

extern crate alloc;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub(crate) struct FreeRing {
    cells: Box<[AtomicU32]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    size: usize,
}

impl FreeRing {
    /// Builds a ring pre-filled with slot indices `0..capacity`.
    pub(crate) fn new(capacity: usize) -> Self {
        let size = capacity + 1;
        let cells: Box<[AtomicU32]> = (0..size)
            .map(|i| AtomicU32::new(if i < capacity { i as u32 } else { 0 }))
            .collect::<alloc::vec::Vec<_>>()
            .into_boxed_slice();
        FreeRing { cells, head: AtomicUsize::new(0), tail: AtomicUsize::new(capacity), size }
    }

    /// Pops a free slot index. Many producers may race here; returns
    /// `None` if the ring is currently empty (every slot is in use).
    pub(crate) fn pop(&self) -> Option<u32> {
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);
            if h == t {
                return None;
            }
            let idx = self.cells[h].load(Ordering::Acquire);
            let next_h = (h + 1) % self.size;
            if self
                .head
                .compare_exchange_weak(h, next_h, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
    }

    /// Returns a slot index to the ring. Only ever called from the single
    /// consumer thread during `flush`, so no CAS is needed on `tail`.
    pub(crate) fn push(&self, idx: u32) {
        let t = self.tail.load(Ordering::Relaxed);
        self.cells[t].store(idx, Ordering::Release);
        let next_t = (t + 1) % self.size;
        self.tail.store(next_t, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_exactly_capacity_slots_then_reports_empty() {
        let ring = FreeRing::new(4);
        let mut popped = alloc::vec::Vec::new();
        while let Some(idx) = ring.pop() {
            popped.push(idx);
        }
        popped.sort_unstable();
        assert_eq!(popped, alloc::vec![0, 1, 2, 3]);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn push_then_pop_reuses_slot() {
        let ring = FreeRing::new(1);
        let idx = ring.pop().unwrap();
        assert!(ring.pop().is_none());
        ring.push(idx);
        assert_eq!(ring.pop(), Some(idx));
    }
}
