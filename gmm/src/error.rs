//! The error taxonomy every GMM operation returns through (§7).

use core::fmt;

/// Every failure mode a GMM entry point can report. Errors from the host
/// allocator or the chunk lifecycle propagate up unchanged; callers that
/// accumulate several of these (the handy-page path) keep the
/// last-non-success one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmmError {
    /// Caller violated an input contract: bad sizes, null handles,
    /// out-of-range enum values.
    InvalidParameter,
    /// A per-VM call was made from a thread other than the VM's
    /// designated thread.
    NotOwner,
    /// Reservation/update/allocate sequencing was violated (e.g. a
    /// reservation before a VM was registered, or a double reservation).
    WrongOrder,
    /// The allocation would exceed the process-wide page limit.
    HitGlobalLimit,
    /// The allocation would exceed this VM's reservation for the
    /// requested account.
    HitVmAccountLimit,
    /// Legacy mode: the caller must seed a chunk on this VM's behalf
    /// before allocating.
    SeedMe,
    /// A page ID lookup found nothing.
    PageNotFound,
    /// An operation expected a `Private` page but found something else.
    PageNotPrivate,
    /// An operation expected a `Shared` page but found something else.
    PageNotShared,
    /// The host allocator refused to hand out more memory.
    NoMemory,
    /// An internal invariant check failed.
    InternalError,
    /// The operation is declared in the interface but not implemented
    /// (guest page sharing, ballooning, chunk map/unmap).
    NotImplemented,
}

impl fmt::Display for GmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            GmmError::InvalidParameter => "invalid parameter",
            GmmError::NotOwner => "caller is not the VM's designated thread",
            GmmError::WrongOrder => "reservation/allocation sequencing violated",
            GmmError::HitGlobalLimit => "allocation would exceed the global page limit",
            GmmError::HitVmAccountLimit => "allocation would exceed the VM's account reservation",
            GmmError::SeedMe => "legacy mode: caller must seed a chunk first",
            GmmError::PageNotFound => "page id not found",
            GmmError::PageNotPrivate => "page is not private",
            GmmError::PageNotShared => "page is not shared",
            GmmError::NoMemory => "host allocator is out of memory",
            GmmError::InternalError => "internal invariant violated",
            GmmError::NotImplemented => "operation is reserved, not yet implemented",
        };
        f.write_str(msg)
    }
}

pub type GmmResult<T> = Result<T, GmmError>;
