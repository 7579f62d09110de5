//! The deferred work queue itself: a fixed-capacity backing store, a
//! lock-free pending LIFO, and the free-slot ring from [`crate::free_ring`].

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::free_ring::FreeRing;
use crate::stats::QueueStats;

/// Sentinel meaning "no slot" / "end of chain", for both the pending LIFO
/// links and the free-ring contents.
const NONE: u32 = u32::MAX;

/// Which external owner created a queue. Carried only for diagnostics and
/// to answer `destroy_by_owner`; it does not change queue behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOwnerKind {
    Device,
    Driver,
    Internal,
    External,
}

/// Per-queue configuration, fixed at creation.
pub struct QueueConfig {
    /// Fixed item capacity (`N` in the design).
    pub capacity: usize,
    /// `0` means the consumer is signaled on every insert; `> 0` means the
    /// consumer is serviced by a timer at this period instead. The timer
    /// itself is an external collaborator (§1); this crate only records
    /// the interval and exposes [`PdmQueue::poll_interval_ms`] so a timer
    /// service can read it back.
    pub poll_interval_ms: u32,
    pub owner: QueueOwnerKind,
    /// Opaque identity of the owning device/driver instance (a `PDEVINS`/
    /// `PDRVINS`-equivalent handle), used by [`crate::QueueRegistry::destroy_by_owner`]
    /// to tear down every queue a departing device or driver created.
    /// `None` for `Internal`/`External` queues, which are never bulk-torn-down
    /// this way (§6).
    pub owner_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The free ring was empty: every backing slot is currently in use.
    /// §4.I: the caller is responsible for dropping or retrying.
    QueueFull,
}

struct Slot<T> {
    payload: UnsafeCell<MaybeUninit<T>>,
    next: AtomicU32,
}

// SAFETY: a `Slot<T>`'s payload is written by exactly one producer before
// it is linked into the pending list (visible to the consumer via the
// release in the pending-head CAS) and read by exactly one consumer
// during flush, who alone returns it to the free ring (visible to the
// next producer via the free-ring's own acquire/release pair). No two
// threads ever access a live slot's payload concurrently.
unsafe impl<T: Send> Sync for Slot<T> {}

/// A fixed-capacity, lock-free multi-producer / single-consumer deferred
/// work queue.
///
/// Producers call [`PdmQueue::insert`] from any thread or interrupt
/// context. A single designated consumer thread calls [`PdmQueue::flush`]
/// to drain it in submission order, invoking the callback supplied at
/// construction on each item.
pub struct PdmQueue<T: Send> {
    config: QueueConfig,
    slots: Box<[Slot<T>]>,
    pending_head: AtomicU32,
    free: FreeRing,
    callback: Box<dyn Fn(&T) -> bool + Send + Sync>,
    stats: QueueStats,
}

impl<T: Send> PdmQueue<T> {
    pub fn new(
        config: QueueConfig,
        callback: Box<dyn Fn(&T) -> bool + Send + Sync>,
    ) -> Self {
        let mut slots = Vec::with_capacity(config.capacity);
        for _ in 0..config.capacity {
            slots.push(Slot { payload: UnsafeCell::new(MaybeUninit::uninit()), next: AtomicU32::new(NONE) });
        }
        let stats = QueueStats::new(config.capacity, core::mem::size_of::<T>());
        PdmQueue {
            free: FreeRing::new(config.capacity),
            slots: slots.into_boxed_slice(),
            pending_head: AtomicU32::new(NONE),
            config,
            callback,
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn poll_interval_ms(&self) -> u32 {
        self.config.poll_interval_ms
    }

    pub fn owner(&self) -> QueueOwnerKind {
        self.config.owner
    }

    pub fn owner_id(&self) -> Option<u64> {
        self.config.owner_id
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Producer operation. Pops a free backing slot, writes `payload` into
    /// it, and CAS-links it onto the pending LIFO head.
    ///
    /// Returns [`InsertError::QueueFull`] if every slot is currently in
    /// use; the caller decides whether to drop the item or retry.
    pub fn insert(&self, payload: T) -> Result<(), InsertError> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("pdm_queue: insert failed, queue full (capacity={})", self.config.capacity);
                return Err(InsertError::QueueFull);
            }
        };

        let slot = &self.slots[idx as usize];
        // SAFETY: this slot was just popped from the free ring, so no
        // other thread holds it; the consumer cannot see it again until
        // we publish it via the pending-head CAS below.
        unsafe { (*slot.payload.get()).write(payload) };

        loop {
            let head = self.pending_head.load(Ordering::Acquire);
            slot.next.store(head, Ordering::Relaxed);
            if self
                .pending_head
                .compare_exchange_weak(head, idx, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Consumer operation, called only from the single designated thread.
    ///
    /// Exchanges the pending head for empty, reverses the chain to
    /// restore submission order, and invokes the callback on each item in
    /// turn. The callback returning `false` halts draining; that item and
    /// everything after it are spliced back onto the pending list (ahead
    /// of anything a concurrent producer inserted meanwhile) so the next
    /// flush sees them first, still in submission order.
    ///
    /// Returns `true` if the queue was left fully drained.
    pub fn flush(&self) -> bool {
        let head = self.pending_head.swap(NONE, Ordering::AcqRel);
        if head == NONE {
            return true;
        }

        // Walk the LIFO (newest first) into a plain Vec, then reverse it
        // to get submission order.
        let mut newest_first = Vec::new();
        let mut cursor = head;
        while cursor != NONE {
            newest_first.push(cursor);
            cursor = self.slots[cursor as usize].next.load(Ordering::Acquire);
        }
        newest_first.reverse();
        let ordered = newest_first;

        let mut halted_at = None;
        for (i, &idx) in ordered.iter().enumerate() {
            let slot = &self.slots[idx as usize];
            // SAFETY: sole consumer thread, item was published by its
            // producer before being linked onto the pending list.
            let keep_going = {
                let payload_ref = unsafe { (*slot.payload.get()).assume_init_ref() };
                (self.callback)(payload_ref)
            };
            if !keep_going {
                halted_at = Some(i);
                break;
            }
            // SAFETY: we just finished reading this slot's payload and it
            // will not be read again until a producer re-writes it after
            // popping it from the free ring.
            unsafe { (*slot.payload.get()).assume_init_drop() };
            self.free.push(idx);
            self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        }

        match halted_at {
            None => true,
            Some(i) => {
                self.stats.flush_leftovers.fetch_add(1, Ordering::Relaxed);
                self.requeue_leftovers(&ordered[i..]);
                false
            }
        }
    }

    /// Re-links `leftover` (submission order) back onto the pending LIFO,
    /// ahead of whatever is there now, without losing anything a producer
    /// inserted while we were draining.
    fn requeue_leftovers(&self, leftover: &[u32]) {
        // Reverse so that a future `flush`'s un-reversal restores
        // `leftover`'s original submission order.
        for pair in leftover.windows(2).rev() {
            let (a, b) = (pair[0], pair[1]);
            self.slots[b as usize].next.store(a, Ordering::Relaxed);
        }
        let new_head = *leftover.last().unwrap();
        let tail = leftover[0];

        loop {
            let cur = self.pending_head.load(Ordering::Acquire);
            self.slots[tail as usize].next.store(cur, Ordering::Relaxed);
            if self
                .pending_head
                .compare_exchange_weak(cur, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// `true` if there is currently nothing waiting to be drained. Not a
    /// synchronization point by itself — a producer may insert the
    /// instant after this returns.
    pub fn is_empty(&self) -> bool {
        self.pending_head.load(Ordering::Acquire) == NONE
    }

    /// Adjusts every persisted pointer this queue carries by `delta`
    /// bytes, for the "relocate" external operation used when the
    /// hypervisor moves its own heap. This implementation is entirely
    /// index-based rather than pointer-based (see `gmm_chunk`'s doubly
    /// linked free-set lists for the same choice), so there is nothing to
    /// adjust; kept as a documented no-op so the external interface
    /// surface matches §6.
    pub fn relocate(&self, _delta: isize) {}
}

impl<T: Send> Drop for PdmQueue<T> {
    fn drop(&mut self) {
        // Drop any items still sitting in the pending list; everything
        // else is either free or already dropped by a successful flush.
        let mut cursor = *self.pending_head.get_mut();
        while cursor != NONE {
            let slot = &mut self.slots[cursor as usize];
            unsafe { slot.payload.get_mut().assume_init_drop() };
            cursor = *slot.next.get_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use spin::Mutex;

    fn queue_with_capture(capacity: usize) -> (PdmQueue<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_cb = seen.clone();
        let q = PdmQueue::new(
            QueueConfig { capacity, poll_interval_ms: 0, owner: QueueOwnerKind::Internal, owner_id: None },
            Box::new(move |item: &u32| {
                seen_for_cb.lock().push(*item);
                true
            }),
        );
        (q, seen)
    }

    #[test]
    fn drains_in_submission_order() {
        let (q, seen) = queue_with_capture(8);
        q.insert(1).unwrap();
        q.insert(2).unwrap();
        q.insert(3).unwrap();
        assert!(q.flush());
        assert_eq!(*seen.lock(), alloc::vec![1, 2, 3]);
    }

    #[test]
    fn partial_drain_preserves_order_for_next_flush() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_cb = seen.clone();
        let halt_at = Arc::new(core::sync::atomic::AtomicU32::new(3));
        let halt_for_cb = halt_at.clone();
        let q = PdmQueue::new(
            QueueConfig { capacity: 8, poll_interval_ms: 0, owner: QueueOwnerKind::Internal, owner_id: None },
            Box::new(move |item: &u32| {
                seen_for_cb.lock().push(*item);
                *item != halt_for_cb.load(Ordering::Relaxed)
            }),
        );
        for i in 1..=5u32 {
            q.insert(i).unwrap();
        }
        assert!(!q.flush());
        assert_eq!(*seen.lock(), alloc::vec![1, 2, 3]);
        assert_eq!(q.stats().flush_leftovers.load(Ordering::Relaxed), 1);

        seen.lock().clear();
        halt_at.store(0, Ordering::Relaxed); // let everything through this time
        assert!(q.flush());
        assert_eq!(*seen.lock(), alloc::vec![3, 4, 5]);
    }

    #[test]
    fn queue_full_reports_alloc_failure() {
        let (q, _seen) = queue_with_capture(1);
        q.insert(1).unwrap();
        assert_eq!(q.insert(2), Err(InsertError::QueueFull));
        assert_eq!(q.stats().alloc_failures.load(Ordering::Relaxed), 1);
    }
}
