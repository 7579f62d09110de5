//! Compile-time constants describing the page/chunk layout used throughout
//! the global memory manager.
//!
//! This mirrors the way the donor kernel keeps its memory-layout constants
//! (page size, table indices, etc.) in a single small crate that every other
//! memory-related crate depends on, rather than scattering magic numbers
//! across the allocator implementation.

#![cfg_attr(not(test), no_std)]

/// The lower bits of a host-physical address that index within a page.
pub const PAGE_SHIFT: usize = 12;
/// Value: 4096. The size of a single host-physical page, in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// `log2` of the number of pages in a chunk. The reference value groups
/// 256 pages (1 MiB at a 4 KiB page size) into a single chunk.
pub const CHUNK_SHIFT: usize = 8;
/// Value: 256. The fixed number of pages owned by every chunk.
pub const CHUNK_NUM_PAGES: usize = 1 << CHUNK_SHIFT;
/// Value: 1_048_576. The number of bytes backed by a single chunk.
pub const CHUNK_SIZE_BYTES: usize = CHUNK_NUM_PAGES * PAGE_SIZE;

/// Number of histogram buckets each free set divides its chunks into.
pub const BUCKET_COUNT: usize = 16;
/// `log2(CHUNK_NUM_PAGES / BUCKET_COUNT)`. A chunk with `free` pages lives
/// in bucket `(free - 1) >> BUCKET_SHIFT`.
pub const BUCKET_SHIFT: usize = {
    // CHUNK_NUM_PAGES / BUCKET_COUNT, computed at compile time as a shift
    // rather than a division so the relationship to CHUNK_SHIFT is explicit.
    CHUNK_SHIFT - log2_usize(BUCKET_COUNT)
};
/// A chunk whose `free` count just crossed a bucket boundary is one whose
/// `free & BUCKET_MASK == 0`.
pub const BUCKET_MASK: usize = (1 << BUCKET_SHIFT) - 1;

/// Size of the direct-mapped chunk lookup cache. Must be a power of two.
pub const CHUNK_CACHE_SIZE: usize = 32;
/// Mask used to index into the chunk lookup cache: `id & CHUNK_CACHE_MASK`.
pub const CHUNK_CACHE_MASK: u32 = (CHUNK_CACHE_SIZE as u32) - 1;

/// Number of bits available to a chunk ID once it has been folded into an
/// external page ID alongside a `CHUNK_SHIFT`-bit page index.
pub const PAGE_ID_CHUNK_BITS: usize = 32 - CHUNK_SHIFT;
/// Largest chunk ID that can still be represented in a page ID. Chunk ID 0
/// is permanently reserved as "no chunk".
pub const CHUNK_ID_MAX: u32 = (1u32 << PAGE_ID_CHUNK_BITS) - 1;

const fn log2_usize(mut n: usize) -> usize {
    let mut shift = 0;
    while n > 1 {
        n >>= 1;
        shift += 1;
    }
    shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_math_matches_reference_chunk_size() {
        assert_eq!(CHUNK_NUM_PAGES, 256);
        assert_eq!(BUCKET_SHIFT, 4);
        assert_eq!(BUCKET_MASK, 0b1111);
        assert_eq!((CHUNK_NUM_PAGES - 1) >> BUCKET_SHIFT, BUCKET_COUNT - 1);
    }

    #[test]
    fn chunk_id_space_leaves_room_for_page_index() {
        assert_eq!(PAGE_ID_CHUNK_BITS, 24);
        assert_eq!(CHUNK_ID_MAX, 0x00FF_FFFF);
    }
}
