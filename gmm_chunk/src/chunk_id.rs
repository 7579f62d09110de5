//! Dense 32-bit chunk ID namespace backed by a bitmap with a rotating
//! allocation hint. All access happens while the GMM's single mutex is
//! held, so this allocator does not need its own internal locking or
//! atomics; it assumes exclusive access, like every other internal helper.

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;

use gmm_config::CHUNK_ID_MAX;
use gmm_types::ChunkId;

const BITS_PER_WORD: u32 = 64;

pub struct ChunkIdAllocator {
    bitmap: Vec<u64>,
    /// Total number of representable IDs, including the permanently
    /// reserved ID 0.
    total_ids: u32,
    /// Last ID handed out; the next `allocate()` scans starting at
    /// `hint + 1`.
    hint: u32,
}

impl ChunkIdAllocator {
    pub fn new() -> Self {
        let total_ids = CHUNK_ID_MAX + 1;
        let num_words = ((total_ids + BITS_PER_WORD - 1) / BITS_PER_WORD) as usize;
        let mut bitmap = vec![0u64; num_words];
        // Bit zero is permanently reserved.
        bitmap[0] |= 1;
        ChunkIdAllocator { bitmap, total_ids, hint: 0 }
    }

    fn is_set(&self, id: u32) -> bool {
        let word = (id / BITS_PER_WORD) as usize;
        let bit = id % BITS_PER_WORD;
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn set(&mut self, id: u32) {
        let word = (id / BITS_PER_WORD) as usize;
        let bit = id % BITS_PER_WORD;
        self.bitmap[word] |= 1u64 << bit;
    }

    fn clear(&mut self, id: u32) {
        let word = (id / BITS_PER_WORD) as usize;
        let bit = id % BITS_PER_WORD;
        self.bitmap[word] &= !(1u64 << bit);
    }

    /// Scans for a clear bit starting just past the hint, wrapping around
    /// to the beginning (ID 1, since ID 0 is reserved) if it reaches the
    /// end without finding one. Updates the hint to the allocated ID on
    /// success.
    ///
    /// Returns `None` if every ID is in use; the caller treats this as a
    /// fatal, out-of-memory condition.
    pub fn allocate(&mut self) -> Option<ChunkId> {
        for offset in 1..self.total_ids {
            let candidate = (self.hint + offset) % self.total_ids;
            if candidate == 0 {
                continue;
            }
            if !self.is_set(candidate) {
                self.set(candidate);
                self.hint = candidate;
                return Some(ChunkId::new(candidate));
            }
        }
        log::error!("gmm_chunk: chunk id space exhausted ({} ids in use)", self.total_ids - 1);
        None
    }

    pub fn free(&mut self, id: ChunkId) {
        let raw = id.raw();
        debug_assert!(self.is_set(raw), "freeing a chunk id that wasn't allocated: {id}");
        self.clear(raw);
    }
}

impl Default for ChunkIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
