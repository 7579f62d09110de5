//! The Global Memory Manager: a process-wide allocator that hands
//! host-physical pages to registered VMs, tracks per-page ownership,
//! enforces per-VM reservations, and manages over-commitment.
//!
//! See `descriptor` for the external page-descriptor wire shape,
//! `gmm` for the public entry points, and `error` for the failure
//! taxonomy every one of them returns through.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod allocator;
mod descriptor;
mod error;
mod gmm;
mod handy;
mod inner;
mod lifecycle;
mod policy;
mod vm_record;

pub use descriptor::{
    validate_fixed_request, validate_variable_request, GmmPageDesc, RequestHeader, GC_PHYS_NONE, GC_PHYS_UNSHAREABLE,
};
pub use error::{GmmError, GmmResult};
pub use gmm::Gmm;
pub use policy::{Account, OomPriority, OverCommitPolicy};
pub use vm_record::ReservationTriple;

pub use gmm_host::ThreadId;
pub use gmm_types::{ChunkId, PageId, Pfn, VmHandle};
