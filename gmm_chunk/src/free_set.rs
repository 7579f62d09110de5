//! The free set: a histogram of chunks bucketed by free-page count. The
//! GMM keeps two of these (one biased toward private allocations, one
//! toward shared), but a single `FreeSet` doesn't know or care which.

extern crate alloc;
use alloc::vec::Vec;

use gmm_config::{BUCKET_COUNT, BUCKET_SHIFT};
use gmm_types::ChunkId;

use crate::store::ChunkStore;

/// Which of the two free sets a chunk is currently linked into: the one
/// biased toward private allocations, or the one biased toward shared
/// pages (§3). A chunk carries this tag (see [`crate::Chunk::pool`]) so
/// that a caller holding only a [`ChunkId`] can find the right `FreeSet`
/// to unlink it from, without guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Private,
    Shared,
}

pub struct FreeSet {
    kind: Pool,
    buckets: [Option<ChunkId>; BUCKET_COUNT],
    total_free_pages: u64,
}

impl FreeSet {
    pub fn new(kind: Pool) -> Self {
        FreeSet { kind, buckets: [None; BUCKET_COUNT], total_free_pages: 0 }
    }

    pub fn kind(&self) -> Pool {
        self.kind
    }

    pub fn total_free_pages(&self) -> u64 {
        self.total_free_pages
    }

    /// `(free - 1) >> BUCKET_SHIFT`, as specified. Callers must only pass
    /// `free > 0`; a chunk with zero free pages is never linked.
    pub fn bucket_of(free: u32) -> usize {
        debug_assert!(free > 0, "a chunk with 0 free pages must not be linked");
        ((free - 1) as usize) >> BUCKET_SHIFT
    }

    pub fn bucket_head(&self, bucket: usize) -> Option<ChunkId> {
        self.buckets[bucket]
    }

    /// Number of buckets, exposed so callers can iterate `0..bucket_count()`
    /// in the ascending order the page allocator requires.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Links `id` at the head of the bucket matching its current `free`
    /// count.
    ///
    /// # Panics
    /// Panics (in debug builds) if `id` is already linked, or has zero
    /// free pages.
    pub fn link(&mut self, store: &mut ChunkStore, id: ChunkId) {
        let free = store.lookup(id).expect("link: unknown chunk id").free_count();
        let bucket = Self::bucket_of(free);
        let old_head = self.buckets[bucket];

        let chunk = store.lookup_mut(id).expect("link: unknown chunk id");
        debug_assert!(!chunk.is_linked(), "chunk {id} linked twice");
        chunk.free_prev = None;
        chunk.free_next = old_head;
        chunk.bucket = Some(bucket as u8);
        chunk.pool = Some(self.kind);

        if let Some(old_head_id) = old_head {
            store.lookup_mut(old_head_id).expect("dangling bucket head").free_prev = Some(id);
        }
        self.buckets[bucket] = Some(id);
        self.total_free_pages += free as u64;
    }

    /// Unlinks `id` from whichever bucket it's in. A no-op if it isn't
    /// currently linked.
    pub fn unlink(&mut self, store: &mut ChunkStore, id: ChunkId) {
        let Some(chunk) = store.lookup(id) else { return };
        let Some(bucket) = chunk.bucket() else { return };
        let prev = chunk.free_prev;
        let next = chunk.free_next;
        let free = chunk.free_count();

        if let Some(p) = prev {
            store.lookup_mut(p).expect("dangling free_prev").free_next = next;
        } else {
            self.buckets[bucket as usize] = next;
        }
        if let Some(n) = next {
            store.lookup_mut(n).expect("dangling free_next").free_prev = prev;
        }

        let chunk = store.lookup_mut(id).expect("unlink: unknown chunk id");
        chunk.bucket = None;
        chunk.free_prev = None;
        chunk.free_next = None;
        chunk.pool = None;

        self.total_free_pages -= free as u64;
    }

    /// Re-links `id` after its `free` count changed (it must currently be
    /// unlinked), placing it in the bucket matching its new count.
    pub fn relink(&mut self, store: &mut ChunkStore, id: ChunkId) {
        self.link(store, id);
    }

    /// Snapshots the chain of chunk IDs currently in `bucket`, in
    /// head-to-tail order, without holding any borrow of `store`. The page
    /// allocator uses this before mutating chunks in the bucket, since
    /// re-linking a chunk mid-scan would otherwise invalidate an in-place
    /// iterator.
    pub fn snapshot_bucket(&self, store: &ChunkStore, bucket: usize) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut cursor = self.buckets[bucket];
        while let Some(id) = cursor {
            out.push(id);
            cursor = store.foreach_chunk_next(id);
        }
        out
    }
}

// Small helper kept on `ChunkStore`'s module so `FreeSet::snapshot_bucket`
// doesn't need a public accessor for the raw `free_next` link.
impl ChunkStore {
    pub(crate) fn foreach_chunk_next(&self, id: ChunkId) -> Option<ChunkId> {
        // `lookup` takes `&mut self` for its cache-refill side effect, but
        // callers here only have `&self`; fall back to a direct map probe.
        self.peek(id).and_then(|c| c.free_next)
    }
}
