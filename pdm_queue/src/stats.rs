//! Per-queue statistics counters.
//!
//! The reference implementation registers six counters per queue with
//! the host's statistics registry at creation time and is supposed to
//! deregister exactly those six at destruction. §9 flags a known bug in
//! the source: its destroy path deregisters `cbItem` twice and never
//! deregisters `cItems` at all. [`QueueStats`] models the correct set of
//! six so a `Drop` impl here cannot repeat that mistake — there is
//! nothing to "forget" because there is no separate deregister step; the
//! counters simply live and die with the queue.

use core::sync::atomic::AtomicU64;

/// The six per-queue counters the design calls out. `item_size` and
/// `capacity` are fixed at creation; the rest are live counters updated
/// by [`crate::PdmQueue::insert`] and [`crate::PdmQueue::flush`].
pub struct QueueStats {
    /// `cbItem`: size in bytes of one item.
    pub item_size: usize,
    /// `cItems`: fixed item capacity.
    pub capacity: usize,
    /// Total successful inserts over the queue's lifetime.
    pub inserted: AtomicU64,
    /// Times `insert` failed because the free ring was empty.
    pub alloc_failures: AtomicU64,
    /// Times a `flush` halted early (the callback returned `false`) and
    /// left items to be re-drained by a subsequent flush.
    pub flush_leftovers: AtomicU64,
    /// Total items the consumer callback has accepted (returned `true`
    /// for) across all flushes.
    pub consumed: AtomicU64,
}

impl QueueStats {
    pub(crate) fn new(capacity: usize, item_size: usize) -> Self {
        QueueStats {
            item_size,
            capacity,
            inserted: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            flush_leftovers: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }
}
