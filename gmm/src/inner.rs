//! The GMM's process-wide mutable state (§3, "GMM singleton"), guarded
//! externally by the single mutex in [`crate::Gmm`].

extern crate alloc;
use alloc::collections::BTreeMap;

use gmm_chunk::{ChunkIdAllocator, ChunkStore, FreeSet, Pool};
use gmm_types::VmHandle;

use crate::vm_record::VmRecord;

pub struct GmmInner {
    pub store: ChunkStore,
    pub free_private: FreeSet,
    pub free_shared: FreeSet,
    pub chunk_ids: ChunkIdAllocator,
    pub vm_records: BTreeMap<VmHandle, VmRecord>,

    pub max_pages: u64,
    pub reserved_pages: u64,
    pub over_committed_pages: u64,
    pub allocated_pages: u64,
    pub shared_pages: u64,
    pub chunk_count: u32,
    pub registered_vm_count: u32,
    pub legacy_mode: bool,
}

impl GmmInner {
    pub fn new(max_pages: u64, legacy_mode: bool) -> Self {
        GmmInner {
            store: ChunkStore::new(),
            free_private: FreeSet::new(Pool::Private),
            free_shared: FreeSet::new(Pool::Shared),
            chunk_ids: ChunkIdAllocator::new(),
            vm_records: BTreeMap::new(),
            max_pages,
            reserved_pages: 0,
            over_committed_pages: 0,
            allocated_pages: 0,
            shared_pages: 0,
            chunk_count: 0,
            registered_vm_count: 0,
            legacy_mode,
        }
    }

    pub fn free_set_ref(&self, pool: Pool) -> &FreeSet {
        match pool {
            Pool::Private => &self.free_private,
            Pool::Shared => &self.free_shared,
        }
    }

    /// Splits into disjoint mutable borrows of the named free set and the
    /// chunk store, so callers can `link`/`unlink` without the store
    /// already being borrowed through a combined accessor.
    pub fn free_set_and_store(&mut self, pool: Pool) -> (&mut FreeSet, &mut ChunkStore) {
        match pool {
            Pool::Private => (&mut self.free_private, &mut self.store),
            Pool::Shared => (&mut self.free_shared, &mut self.store),
        }
    }

    /// §8 property 1: `reserved_pages - over_committed_pages <= max_pages`.
    pub fn invariant_reservation_within_limit(&self) -> bool {
        self.reserved_pages - self.over_committed_pages <= self.max_pages
    }

    /// §8 property 2: `shared_pages <= allocated_pages`.
    pub fn invariant_shared_within_allocated(&self) -> bool {
        self.shared_pages <= self.allocated_pages
    }

    /// §8 property 3: per-VM allocation sums reconcile against the
    /// global counters.
    pub fn invariant_per_vm_sums_reconcile(&self) -> bool {
        let sum: u64 = self
            .vm_records
            .values()
            .map(|r| r.allocated.sum())
            .sum();
        sum == self.allocated_pages - self.shared_pages
    }
}
