//! Interfaces to the collaborators the global memory manager treats as
//! external: the host-OS physical-memory allocator, the VM lifecycle
//! manager, and the thread-identity check used to guard per-VM entry
//! points. §1 of the design calls these out explicitly as "interfaces
//! only" — this crate is those interfaces, plus a bump-pointer test
//! double so `gmm`'s own test suite doesn't need a real hypervisor host.
//!
//! Modeled the way `frame_allocator` leaves "where do physical frames
//! actually come from" to a `PhysicalMemoryArea` list handed in at `init`,
//! rather than hard-wiring a bootloader dependency into the allocator.

#![cfg_attr(not(test), no_std)]

use gmm_types::HostPhysAddr;

/// An opaque host-memory handle: one chunk's worth of (possibly
/// non-contiguous) physical memory, as returned by [`HostPageAllocator`].
///
/// The GMM never interprets `token`; it is round-tripped back to
/// [`HostPageAllocator::free_chunk`] verbatim. `base` is the host-physical
/// address of the chunk's first page, used to compute every other page's
/// address via [`gmm_page::host_phys_addr_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostChunkMemory {
    pub base: HostPhysAddr,
    pub token: u64,
}

/// Why the host allocator could not satisfy an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAllocError {
    /// The host is out of physical memory, or its non-contiguous
    /// allocation primitive is unavailable (legacy-mode platforms).
    NoMemory,
}

/// The host-OS collaborator that actually owns physical RAM.
///
/// Implementations back [`probe_supports_noncontiguous`] with a one-time
/// capability check (e.g. a kernel API that may or may not exist on this
/// platform); [`init`](crate) calls it exactly once and latches the result
/// as the GMM's legacy-mode flag for the rest of the process's lifetime.
pub trait HostPageAllocator: Send {
    /// Probes whether this host can allocate a chunk's worth of
    /// *non-contiguous* physical pages. `false` puts the GMM into legacy
    /// mode, where every page in a chunk must come from the VM that
    /// seeded it.
    fn probe_supports_noncontiguous(&self) -> bool;

    /// Allocates one chunk's worth (`gmm_config::CHUNK_NUM_PAGES` pages)
    /// of host-physical memory. May block; the GMM's mutex is explicitly
    /// permitted to be held across this call (see the design's
    /// concurrency model).
    fn allocate_chunk(&self) -> Result<HostChunkMemory, HostAllocError>;

    /// Returns a chunk's host memory to the host OS. Infallible from the
    /// GMM's perspective: once a chunk has no mappings and is unlinked
    /// from the store, giving its memory back cannot meaningfully fail.
    fn free_chunk(&self, mem: HostChunkMemory);
}

/// A caller-supplied thread identity, opaque to the GMM.
///
/// Per-VM entry points require the caller to be the VM's designated
/// thread (§5); the GMM itself has no task system, so it stores whatever
/// token the VM lifecycle manager hands it at [`init_per_vm`](crate) time
/// and compares by equality on every subsequent per-VM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const fn new(raw: u64) -> Self {
        ThreadId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// The VM lifecycle manager, in its capacity as a collaborator the GMM
/// calls out to rather than owns (§1: "explicitly out of scope").
pub trait VmCollaborator: Send {
    /// Asks the owning VM to tear down its mapping of `chunk` at
    /// `user_address` asynchronously. Used by chunk release (§4.E) when a
    /// chunk still has live user-space mappings: the GMM cannot free the
    /// chunk's host memory until every mapping is gone, so it posts this
    /// request and returns without freeing.
    fn request_unmap(&self, vm: gmm_types::VmHandle, chunk: gmm_types::ChunkId, user_address: usize);
}

/// A host collaborator double for use in tests: a simple bump allocator
/// over a large flat address range, with no actual backing memory.
///
/// Exists so `gmm`'s test suite can drive the full allocate/free/grow
/// machinery without depending on a real hypervisor host; enabled with
/// the `testing` feature, the same way `frame_allocator`'s own test
/// module fabricates a flat `PhysicalMemoryArea` list instead of reading
/// the real bootloader memory map.
#[cfg(feature = "testing")]
pub mod testing {
    extern crate alloc;

    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use gmm_config::CHUNK_SIZE_BYTES;

    /// Hands out ever-increasing chunk-sized host addresses; `free_chunk`
    /// is a no-op. Not thread-safe beyond the atomic counter (there is no
    /// reclamation), which is fine for single-threaded unit tests.
    pub struct FakeHostAllocator {
        next_base: AtomicU64,
        supports_noncontiguous: bool,
        fail_after: Option<AtomicU64>,
    }

    impl FakeHostAllocator {
        pub fn new(supports_noncontiguous: bool) -> Self {
            FakeHostAllocator {
                next_base: AtomicU64::new(0x1_0000_0000),
                supports_noncontiguous,
                fail_after: None,
            }
        }

        /// Builds an allocator that returns [`HostAllocError::NoMemory`]
        /// once `count` chunks have been handed out, to exercise the
        /// chunk-lifecycle unwind path on host exhaustion.
        pub fn limited(supports_noncontiguous: bool, count: u64) -> Self {
            FakeHostAllocator {
                next_base: AtomicU64::new(0x1_0000_0000),
                supports_noncontiguous,
                fail_after: Some(AtomicU64::new(count)),
            }
        }
    }

    impl HostPageAllocator for FakeHostAllocator {
        fn probe_supports_noncontiguous(&self) -> bool {
            self.supports_noncontiguous
        }

        fn allocate_chunk(&self) -> Result<HostChunkMemory, HostAllocError> {
            if let Some(budget) = &self.fail_after {
                if budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    if v == 0 {
                        None
                    } else {
                        Some(v - 1)
                    }
                }).is_err() {
                    return Err(HostAllocError::NoMemory);
                }
            }
            let base = self.next_base.fetch_add(CHUNK_SIZE_BYTES as u64, Ordering::SeqCst);
            Ok(HostChunkMemory { base: HostPhysAddr::new(base), token: base })
        }

        fn free_chunk(&self, _mem: HostChunkMemory) {}
    }

    /// A [`VmCollaborator`] double that just counts how many times it was
    /// asked to unmap something, for asserting the chunk-release path
    /// posted exactly the requests it should have.
    pub struct RecordingVmCollaborator {
        pub requests: spin::Mutex<alloc::vec::Vec<(gmm_types::VmHandle, gmm_types::ChunkId, usize)>>,
    }

    impl RecordingVmCollaborator {
        pub fn new() -> Self {
            RecordingVmCollaborator { requests: spin::Mutex::new(alloc::vec::Vec::new()) }
        }
    }

    impl Default for RecordingVmCollaborator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VmCollaborator for RecordingVmCollaborator {
        fn request_unmap(&self, vm: gmm_types::VmHandle, chunk: gmm_types::ChunkId, user_address: usize) {
            self.requests.lock().push((vm, chunk, user_address));
        }
    }
}
