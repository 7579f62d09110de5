//! The chunk store: an ordered map from chunk ID to chunk record, fronted
//! by a small direct-mapped lookup cache.

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use gmm_config::{CHUNK_CACHE_MASK, CHUNK_CACHE_SIZE};
use gmm_types::ChunkId;

use crate::chunk::Chunk;

#[derive(Clone, Copy)]
struct CacheSlot {
    id: ChunkId,
    ptr: NonNull<Chunk>,
}

/// Owns every live [`Chunk`], keyed by its [`ChunkId`].
///
/// # Safety invariant
/// Chunks are heap-allocated individually (`Box<Chunk>`) so that their
/// addresses stay stable across `BTreeMap` node rebalances; the lookup
/// cache stores raw pointers into those boxes. This is sound only because
/// every access to a `ChunkStore` happens while the GMM's single mutex is
/// held, which rules out concurrent mutation that could otherwise race
/// with the cache. `remove()` always invalidates a cache slot that points
/// at the chunk being removed, so the cache can never outlive its chunk.
pub struct ChunkStore {
    map: BTreeMap<ChunkId, Box<Chunk>>,
    cache: [Option<CacheSlot>; CHUNK_CACHE_SIZE],
}

// See the safety invariant documented on `ChunkStore` above: all access is
// serialized by the GMM's external mutex, so the raw pointers in `cache`
// never observe concurrent mutation.
unsafe impl Send for ChunkStore {}

impl ChunkStore {
    pub fn new() -> Self {
        ChunkStore { map: BTreeMap::new(), cache: [None; CHUNK_CACHE_SIZE] }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn cache_index(id: ChunkId) -> usize {
        (id.raw() & CHUNK_CACHE_MASK) as usize
    }

    fn fill_cache(&mut self, id: ChunkId, ptr: NonNull<Chunk>) {
        self.cache[Self::cache_index(id)] = Some(CacheSlot { id, ptr });
    }

    pub fn insert(&mut self, chunk: Chunk) {
        let id = chunk.id();
        let mut boxed = Box::new(chunk);
        let ptr = NonNull::from(boxed.as_mut());
        self.map.insert(id, boxed);
        self.fill_cache(id, ptr);
    }

    /// Removes and returns the chunk with the given ID, invalidating its
    /// cache slot only if that slot currently points at this chunk.
    pub fn remove(&mut self, id: ChunkId) -> Option<Box<Chunk>> {
        let slot_idx = Self::cache_index(id);
        if matches!(self.cache[slot_idx], Some(slot) if slot.id == id) {
            self.cache[slot_idx] = None;
        }
        self.map.remove(&id)
    }

    pub fn lookup(&mut self, id: ChunkId) -> Option<&Chunk> {
        let slot_idx = Self::cache_index(id);
        if let Some(slot) = self.cache[slot_idx] {
            if slot.id == id {
                // SAFETY: see the `ChunkStore` type-level safety invariant.
                return Some(unsafe { slot.ptr.as_ref() });
            }
        }
        let boxed = self.map.get_mut(&id)?;
        let ptr = NonNull::from(boxed.as_mut());
        self.fill_cache(id, ptr);
        Some(unsafe { ptr.as_ref() })
    }

    pub fn lookup_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        let slot_idx = Self::cache_index(id);
        if let Some(slot) = self.cache[slot_idx] {
            if slot.id == id {
                // SAFETY: see the `ChunkStore` type-level safety invariant.
                // `&mut self` proves no other live borrow of this chunk
                // exists for the duration of the returned reference.
                let mut ptr = slot.ptr;
                return Some(unsafe { ptr.as_mut() });
            }
        }
        let boxed = self.map.get_mut(&id)?;
        let mut ptr = NonNull::from(boxed.as_mut());
        self.fill_cache(id, ptr);
        Some(unsafe { ptr.as_mut() })
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.map.contains_key(&id)
    }

    /// Read-only lookup that never touches the cache (it needs `&mut self`
    /// to refill on a miss). Used by callers that only have a shared
    /// borrow, such as [`crate::free_set::FreeSet::snapshot_bucket`].
    pub fn peek(&self, id: ChunkId) -> Option<&Chunk> {
        self.map.get(&id).map(|b| b.as_ref())
    }

    pub fn foreach(&self, mut f: impl FnMut(&Chunk)) {
        for chunk in self.map.values() {
            f(chunk);
        }
    }

    pub fn foreach_mut(&mut self, mut f: impl FnMut(&mut Chunk)) {
        for chunk in self.map.values_mut() {
            f(chunk);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.map.keys().copied()
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}
