//! A single chunk: a fixed number of contiguous host pages, backed by one
//! host-memory allocation, with its own free-page LIFO.

use gmm_config::CHUNK_NUM_PAGES;
use gmm_page::PageDescriptor;
use gmm_types::{ChunkId, HostPhysAddr, Pfn, VmHandle};

extern crate alloc;
use alloc::vec::Vec;

/// Records that a range of a chunk's pages is mapped into some VM's
/// user-space address space. The map/unmap operations that produce and
/// consume these are declared in the external interface but not
/// implemented (see the crate-level docs on `gmm::ops`); the data lives
/// here so `release()` can still honor the "don't free a mapped chunk"
/// invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    pub vm: VmHandle,
    pub user_address: usize,
}

/// A fixed-size group of [`gmm_config::CHUNK_NUM_PAGES`] contiguous host
/// pages, backed by one allocation handed out by the host collaborator.
pub struct Chunk {
    id: ChunkId,
    host_base: HostPhysAddr,
    /// Opaque token the host collaborator returned alongside `host_base`;
    /// round-tripped back to it verbatim when the chunk is released. The
    /// chunk bookkeeping here never interprets it.
    host_token: u64,
    pages: [PageDescriptor; CHUNK_NUM_PAGES],
    free_head: Option<u32>,
    free: u32,
    private: u32,
    shared: u32,
    affinity: Option<VmHandle>,
    pub(crate) free_prev: Option<ChunkId>,
    pub(crate) free_next: Option<ChunkId>,
    pub(crate) bucket: Option<u8>,
    /// Which of the two free sets this chunk is linked into, mirroring
    /// `bucket.is_some()`. Lets a caller holding only a [`ChunkId`] find
    /// the right [`crate::FreeSet`] to unlink it from.
    pub(crate) pool: Option<crate::free_set::Pool>,
    mappings: Vec<ChunkMapping>,
}

impl Chunk {
    /// Builds a brand-new chunk with every page chained into the free LIFO
    /// (page 0 at the head, so it is the first one popped).
    pub fn new(id: ChunkId, host_base: HostPhysAddr, host_token: u64) -> Self {
        let pages = core::array::from_fn(|i| {
            let next = if i + 1 < CHUNK_NUM_PAGES { Some((i + 1) as u32) } else { None };
            PageDescriptor::make_free(next)
        });
        Chunk {
            id,
            host_base,
            host_token,
            pages,
            free_head: Some(0),
            free: CHUNK_NUM_PAGES as u32,
            private: 0,
            shared: 0,
            affinity: None,
            free_prev: None,
            free_next: None,
            bucket: None,
            pool: None,
            mappings: Vec::new(),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn host_base(&self) -> HostPhysAddr {
        self.host_base
    }

    pub fn host_token(&self) -> u64 {
        self.host_token
    }

    pub fn free_count(&self) -> u32 {
        self.free
    }

    pub fn private_count(&self) -> u32 {
        self.private
    }

    pub fn shared_count(&self) -> u32 {
        self.shared
    }

    pub fn is_fully_free(&self) -> bool {
        self.free as usize == CHUNK_NUM_PAGES
    }

    pub fn affinity(&self) -> Option<VmHandle> {
        self.affinity
    }

    /// Adopts `vm` as this chunk's affinity owner, but only if it doesn't
    /// have one yet. Matches the "first pop from a virgin chunk claims it"
    /// rule in the page allocator's fallback pass.
    pub fn adopt_affinity(&mut self, vm: VmHandle) {
        if self.affinity.is_none() {
            self.affinity = Some(vm);
        }
    }

    pub fn bucket(&self) -> Option<u8> {
        self.bucket
    }

    pub fn is_linked(&self) -> bool {
        self.bucket.is_some()
    }

    /// Which free set this chunk is currently linked into, if any.
    pub fn pool(&self) -> Option<crate::free_set::Pool> {
        self.pool
    }

    pub fn page(&self, index: u32) -> PageDescriptor {
        self.pages[index as usize]
    }

    pub fn set_page(&mut self, index: u32, desc: PageDescriptor) {
        self.pages[index as usize] = desc;
    }

    /// Pops a free page for `vm`, turning it `Private` with `pfn`, updating
    /// the chunk's affinity and counters. Returns the in-chunk page index
    /// of the newly-allocated page, or `None` if the chunk has no free
    /// pages left.
    pub fn allocate_one_private(&mut self, vm: VmHandle, pfn: Pfn) -> Option<u32> {
        let index = self.pop_free_internal()?;
        self.pages[index as usize] = PageDescriptor::make_private(vm, pfn);
        self.private += 1;
        self.adopt_affinity(vm);
        Some(index)
    }

    /// Marks the page at `index` as freshly allocated but leaves it in its
    /// current (already-written) descriptor state; used by the chunk
    /// lifecycle's seeding path which writes descriptors directly. Most
    /// callers want [`Chunk::allocate_one_private`] instead.
    fn pop_free_internal(&mut self) -> Option<u32> {
        let head = self.free_head?;
        let desc = self.pages[head as usize];
        debug_assert!(desc.is_free(), "free list head {head} is not Free");
        self.free_head = desc.read_next_free();
        self.free -= 1;
        Some(head)
    }

    /// Reclaims a `Private` page at `index` back to `Free`. Caller is
    /// responsible for having already verified the page was private and
    /// owned by the right VM.
    pub fn free_private_page(&mut self, index: u32) {
        self.push_free_internal(index);
        self.private -= 1;
    }

    /// Turns the page at `index` into `Shared` with an initial refcount of
    /// one, incrementing this chunk's private counter down and shared
    /// counter up. Used when a private page is converted for sharing.
    /// Not exercised by the current operation set (guest page sharing is
    /// reserved but unimplemented), kept for the data model in `§3`.
    #[allow(dead_code)]
    pub fn convert_private_to_shared(&mut self, index: u32) {
        debug_assert!(self.pages[index as usize].is_private());
        self.pages[index as usize] = PageDescriptor::make_shared(1);
        self.private -= 1;
        self.shared += 1;
    }

    /// Reclaims a `Shared` page (whose refcount has already dropped to
    /// zero) back to `Free`.
    pub fn free_shared_page(&mut self, index: u32) {
        self.push_free_internal(index);
        self.shared -= 1;
    }

    fn push_free_internal(&mut self, index: u32) {
        let next = self.free_head;
        self.pages[index as usize] = PageDescriptor::make_free(next);
        self.free_head = Some(index);
        self.free += 1;
    }

    pub fn mappings(&self) -> &[ChunkMapping] {
        &self.mappings
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn add_mapping(&mut self, mapping: ChunkMapping) {
        self.mappings.push(mapping);
    }

    /// Verifies the per-chunk invariant from the design:
    /// `free + private + shared == CHUNK_NUM_PAGES`.
    pub fn counters_balanced(&self) -> bool {
        self.free as usize + self.private as usize + self.shared as usize == CHUNK_NUM_PAGES
    }

    /// Walks the in-chunk free LIFO and returns its length, or `None` if it
    /// contains a duplicate index (a cycle or a corrupted link).
    pub fn free_list_len(&self) -> Option<u32> {
        let mut seen = alloc::vec![false; CHUNK_NUM_PAGES];
        let mut count = 0u32;
        let mut cursor = self.free_head;
        while let Some(idx) = cursor {
            let idx_usize = idx as usize;
            if idx_usize >= CHUNK_NUM_PAGES || seen[idx_usize] {
                return None;
            }
            seen[idx_usize] = true;
            count += 1;
            cursor = self.pages[idx_usize].read_next_free();
        }
        Some(count)
    }
}

impl core::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("free", &self.free)
            .field("private", &self.private)
            .field("shared", &self.shared)
            .field("affinity", &self.affinity)
            .field("bucket", &self.bucket)
            .finish()
    }
}
