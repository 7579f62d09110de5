//! `flush_all`: the process-wide "forced-action queue" sweep, and the
//! double-checked active/pending handshake that makes it correct against
//! concurrent producers. Per §4.I, this is "the sole correctness-critical
//! ordering in the system".

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

const FLAG_ACTIVE: u8 = 1;
const FLAG_PENDING: u8 = 2;

/// A non-generic handle any [`crate::PdmQueue<T>`] implements, so a
/// [`QueueRegistry`] can hold queues of different item types together.
pub trait FlushableQueue: Send + Sync {
    /// Runs one flush of this queue using its own stored callback.
    /// Returns `true` if it is now fully drained.
    fn flush(&self) -> bool;

    /// Monotonically increasing count of successful inserts, used by
    /// [`QueueRegistry::flush_all`] to detect a producer racing an insert
    /// in while a drain pass was running.
    fn insert_count(&self) -> u64;

    /// The owning device/driver instance's opaque identity, if any. Used
    /// by [`QueueRegistry::destroy_by_owner`] to find every queue a
    /// departing device or driver created (§6: `PDMR3QueueDestroyDevice`/
    /// `PDMR3QueueDestroyDriver`).
    fn owner_id(&self) -> Option<u64>;
}

impl<T: Send> FlushableQueue for crate::PdmQueue<T> {
    fn flush(&self) -> bool {
        crate::PdmQueue::flush(self)
    }

    fn insert_count(&self) -> u64 {
        self.stats().inserted.load(Ordering::Relaxed)
    }

    fn owner_id(&self) -> Option<u64> {
        crate::PdmQueue::owner_id(self)
    }
}

/// An external edge-triggered indicator (e.g. a CPU's forced-action bit)
/// that something in this queue set needs draining. Modeled as a trait
/// because the real indicator lives in the surrounding emulator, out of
/// this crate's scope (§1).
pub trait ForcedActionIndicator: Send + Sync {
    fn clear(&self);
    fn set(&self);
}

/// The process-wide set of forced-action queues and the active/pending
/// flag guarding concurrent `flush_all` calls.
///
/// Algorithm (§4.I):
/// 1. clear the external indicator before starting,
/// 2. set `ACTIVE`, clear `PENDING`, drain every queue,
/// 3. if `PENDING` was set *during* the drain (by any inserter calling
///    [`QueueRegistry::note_pending`] is not needed here — any queue that
///    is not fully drained, or whose producer raced an insert in after we
///    last looked, re-sets `PENDING` itself via the loop condition below),
///    loop,
/// 4. clear `ACTIVE`.
/// The external indicator is re-armed if any queue still has undrained
/// items once the loop exits.
pub struct QueueRegistry {
    queues: Mutex<Vec<Arc<dyn FlushableQueue>>>,
    flag: AtomicU8,
}

impl QueueRegistry {
    pub fn new() -> Self {
        QueueRegistry { queues: Mutex::new(Vec::new()), flag: AtomicU8::new(0) }
    }

    pub fn register(&self, queue: Arc<dyn FlushableQueue>) {
        self.queues.lock().push(queue);
    }

    /// Removes a single queue from the set (§6 `PDMR3QueueDestroy`). The
    /// queue itself is torn down when its last `Arc` drops; this only
    /// stops `flush_all` from visiting it.
    pub fn deregister(&self, queue: &Arc<dyn FlushableQueue>) {
        self.queues.lock().retain(|q| !Arc::ptr_eq(q, queue));
    }

    /// Removes every queue whose `owner_id` matches `owner_id` (§6
    /// `PDMR3QueueDestroyDevice`/`PDMR3QueueDestroyDriver`: a device or
    /// driver instance tearing down takes every queue it created with
    /// it). Returns how many queues were removed.
    pub fn destroy_by_owner(&self, owner_id: u64) -> usize {
        let mut queues = self.queues.lock();
        let before = queues.len();
        queues.retain(|q| q.owner_id() != Some(owner_id));
        let removed = before - queues.len();
        if removed > 0 {
            log::debug!("pdm_queue: destroy_by_owner({owner_id}) removed {removed} queue(s)");
        }
        removed
    }

    /// Drains every registered queue, looping while a concurrent producer
    /// raced an insert in during the drain. Returns `true` if every queue
    /// was left fully drained.
    pub fn flush_all(&self, indicator: &dyn ForcedActionIndicator) -> bool {
        indicator.clear();

        loop {
            // Set ACTIVE, clear PENDING.
            self.flag.fetch_or(FLAG_ACTIVE, Ordering::AcqRel);
            self.flag.fetch_and(!FLAG_PENDING, Ordering::AcqRel);

            let queues = self.queues.lock();
            let before: Vec<u64> = queues.iter().map(|q| q.insert_count()).collect();

            let mut all_drained = true;
            for queue in queues.iter() {
                if !queue.flush() {
                    all_drained = false;
                }
            }

            // A producer that inserted into any queue while this pass was
            // draining may have been missed; mark PENDING so we loop. A
            // queue merely having leftovers (its callback returned
            // `false`) is not itself a reason to loop — that is reported
            // via `all_drained` and re-arms the external indicator below
            // instead.
            let raced = queues.iter().zip(before.iter()).any(|(q, &b)| q.insert_count() != b);
            drop(queues);

            if raced {
                self.flag.fetch_or(FLAG_PENDING, Ordering::AcqRel);
            }

            if self.flag.load(Ordering::Acquire) & FLAG_PENDING != 0 {
                continue;
            }

            self.flag.fetch_and(!FLAG_ACTIVE, Ordering::AcqRel);

            if !all_drained {
                indicator.set();
            }
            return all_drained;
        }
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
