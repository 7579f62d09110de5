//! Identifier and handle types shared by every global-memory-manager crate.
//!
//! These are small `Copy` newtypes around integers, the same way the donor
//! kernel wraps `usize`/`u64` addresses in `Frame`/`PhysicalAddress` rather
//! than passing bare integers around. Keeping them here (instead of in the
//! `gmm` crate itself) lets the page codec, the chunk store, and the host
//! collaborator interface all agree on one definition without depending on
//! the engine crate.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use gmm_config::PAGE_ID_CHUNK_BITS;

/// Identifies a single registered virtual machine.
///
/// VM handles are assigned by the (external) VM lifecycle manager; the GMM
/// only ever receives and stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmHandle(u16);

impl VmHandle {
    /// A handle value that is never assigned to a real VM. Used internally
    /// as the "no affinity owner yet" default for a freshly created chunk's
    /// affinity slot before it is expressed as `Option<VmHandle>`.
    pub const NONE: VmHandle = VmHandle(0);

    pub const fn new(raw: u16) -> Self {
        VmHandle(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM#{}", self.0)
    }
}

/// A dense, non-zero chunk identifier. Chunk ID 0 is permanently reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u32);

impl ChunkId {
    /// Constructs a `ChunkId` from a raw, known-non-zero value.
    ///
    /// # Panics
    /// Panics if `raw == 0`; chunk ID zero is reserved and must never be
    /// handed out by the chunk ID allocator.
    pub const fn new(raw: u32) -> Self {
        assert!(raw != 0, "chunk id 0 is reserved");
        ChunkId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk#{}", self.0)
    }
}

/// An external, 32-bit page identifier: `(chunk_id << PAGE_ID_CHUNK_SHIFT) |
/// page_index`. The value zero means "no page".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u32);

impl PageId {
    /// The reserved "no page" identifier.
    pub const NONE: PageId = PageId(0);

    pub const fn from_raw(raw: u32) -> Self {
        PageId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Composes a page ID from a chunk ID and an in-chunk page index.
    ///
    /// `page_index` must be less than `gmm_config::CHUNK_NUM_PAGES`.
    pub const fn compose(chunk_id: ChunkId, page_index: usize) -> PageId {
        PageId((chunk_id.raw() << (32 - PAGE_ID_CHUNK_BITS)) | page_index as u32)
    }

    /// Splits a page ID back into its chunk ID and in-chunk page index.
    ///
    /// # Panics
    /// Panics if `self` is `PageId::NONE`.
    pub fn decompose(self) -> (ChunkId, usize) {
        let page_index_bits = 32 - PAGE_ID_CHUNK_BITS;
        let chunk_id = self.0 >> page_index_bits;
        let page_index = (self.0 as usize) & ((1usize << page_index_bits) - 1);
        (ChunkId::new(chunk_id), page_index)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page#{:#010x}", self.0)
    }
}

/// A host-physical address, or the `NIL` sentinel meaning "none".
///
/// This is distinct from a guest page-frame number (`Pfn`): a `HostPhysAddr`
/// identifies where a page *actually* lives in host RAM, handed back by the
/// host allocator, while a `Pfn` is the guest-visible frame number a VM
/// thinks a private page is mapped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPhysAddr(u64);

impl HostPhysAddr {
    pub const NIL: HostPhysAddr = HostPhysAddr(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        HostPhysAddr(raw)
    }

    pub const fn is_nil(self) -> bool {
        self.0 == u64::MAX
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Width, in bits, of the PFN field in the 64-bit page descriptor layout.
pub const PFN_BITS: u32 = 46;

/// The largest value a `Pfn` field in the packed descriptor can hold.
/// Reserved as the "valid PFN upper bound" sentinel; never a real PFN.
pub const PFN_END: u64 = (1u64 << PFN_BITS) - 1;

/// Marks a private page that backs non-guest memory (e.g. MMIO2) and can
/// never be shared. One less than [`PFN_END`], per the ordering constraint
/// that both sentinels sit strictly above every valid PFN.
pub const PFN_UNSHAREABLE: u64 = PFN_END - 1;

/// A guest page-frame number: host address bits above the page offset.
///
/// Ordering is significant: every valid PFN compares less than
/// [`PFN_UNSHAREABLE`], which in turn compares less than [`PFN_END`]. Code
/// that assigns PFNs must clamp through [`Pfn::clamp_input`] rather than
/// storing an out-of-range value directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pfn(u64);

impl Pfn {
    pub const UNSHAREABLE: Pfn = Pfn(PFN_UNSHAREABLE);
    pub const END: Pfn = Pfn(PFN_END);

    pub const fn new_unchecked(raw: u64) -> Self {
        Pfn(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 < PFN_UNSHAREABLE
    }

    /// Clamps a caller-supplied PFN-ish value onto the three-way range used
    /// throughout the page allocator: a real PFN, the unshareable sentinel,
    /// or "leave untouched" is represented by the caller before calling
    /// this, since `Pfn` itself cannot express "none".
    pub fn clamp_input(raw: u64) -> Pfn {
        if raw >= PFN_UNSHAREABLE {
            Pfn::UNSHAREABLE
        } else {
            Pfn(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_round_trips_for_every_index_and_chunk() {
        for chunk_raw in [1u32, 2, 1234, gmm_config::CHUNK_ID_MAX] {
            let chunk_id = ChunkId::new(chunk_raw);
            for page_index in [0usize, 1, 127, gmm_config::CHUNK_NUM_PAGES - 1] {
                let id = PageId::compose(chunk_id, page_index);
                assert!(!id.is_none());
                let (decoded_chunk, decoded_index) = id.decompose();
                assert_eq!(decoded_chunk, chunk_id);
                assert_eq!(decoded_index, page_index);
            }
        }
    }

    #[test]
    fn sentinel_ordering_holds() {
        assert!(Pfn::new_unchecked(0) < Pfn::UNSHAREABLE);
        assert!(Pfn::UNSHAREABLE < Pfn::END);
        assert!(!HostPhysAddr::new(0).is_nil());
        assert!(HostPhysAddr::NIL.is_nil());
    }

    #[test]
    fn clamp_input_caps_out_of_range_values() {
        assert_eq!(Pfn::clamp_input(5).raw(), 5);
        assert_eq!(Pfn::clamp_input(PFN_UNSHAREABLE), Pfn::UNSHAREABLE);
        assert_eq!(Pfn::clamp_input(u64::MAX), Pfn::UNSHAREABLE);
    }
}
