//! The external page descriptor (§6) and the size-prefixed request
//! wrapper validation every operation's companion entry point performs.

use gmm_types::{PageId, Pfn};

/// Sentinel for "leave the PFN untouched" in [`GmmPageDesc::hc_phys_gc_phys`].
pub const GC_PHYS_NONE: u64 = u64::MAX;
/// Sentinel for "this page backs non-guest memory and can never be
/// shared" in [`GmmPageDesc::hc_phys_gc_phys`].
pub const GC_PHYS_UNSHAREABLE: u64 = u64::MAX - 1;

/// How a caller-supplied `hc_phys_gc_phys` value should be applied to a
/// page's stored PFN, per §4.F/§4.H.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfnInput {
    /// A real guest physical address; store `value >> PAGE_SHIFT`.
    Value(Pfn),
    /// Store [`Pfn::UNSHAREABLE`].
    Unshareable,
    /// Leave the page's current PFN untouched (update path only).
    None,
}

/// Decodes a raw `hc_phys_gc_phys` field per the three-way rule in
/// §4.H: a real address below the sentinels, the unshareable sentinel,
/// or the "leave untouched" sentinel.
pub fn decode_pfn_input(raw: u64) -> PfnInput {
    if raw == GC_PHYS_NONE {
        PfnInput::None
    } else if raw == GC_PHYS_UNSHAREABLE {
        PfnInput::Unshareable
    } else {
        PfnInput::Value(Pfn::clamp_input(raw >> gmm_config::PAGE_SHIFT))
    }
}

/// One page descriptor as it crosses the external interface: caller
/// input and GMM output share the same three fields (§6).
#[derive(Debug, Clone, Copy)]
pub struct GmmPageDesc {
    /// Overloaded: on input, a guest-physical address (or one of the
    /// sentinels above) describing how to set the page's PFN; on output,
    /// the page's host-physical address.
    pub hc_phys_gc_phys: u64,
    /// On input to the handy-page update path, the previously-allocated
    /// private page to retire; on output from an allocation, the newly
    /// allocated page's external ID.
    pub id_page: PageId,
    /// On input to the handy-page update path, a previously-shared page
    /// this VM is releasing its reference to. Not otherwise populated;
    /// guest page sharing is reserved but unimplemented (§1, §9).
    pub id_shared_page: PageId,
}

impl GmmPageDesc {
    pub fn empty() -> Self {
        GmmPageDesc {
            hc_phys_gc_phys: GC_PHYS_NONE,
            id_page: PageId::NONE,
            id_shared_page: PageId::NONE,
        }
    }
}

impl Default for GmmPageDesc {
    fn default() -> Self {
        Self::empty()
    }
}

/// The size-prefix header every request wrapper carries ahead of its
/// fixed fields and (for variable-length requests) a trailing
/// `aPages: [GmmPageDesc]` array.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    /// The byte length the caller claims the whole request occupies.
    pub cb_req: usize,
}

/// Validates a fixed-size request's header against the expected struct
/// size.
pub fn validate_fixed_request(hdr: &RequestHeader, expected_size: usize) -> Result<(), crate::GmmError> {
    if hdr.cb_req != expected_size {
        Err(crate::GmmError::InvalidParameter)
    } else {
        Ok(())
    }
}

/// Validates a variable-length request (one carrying a trailing
/// `aPages` array) against `offset_of(aPages) + cPages * sizeof(GmmPageDesc)`.
pub fn validate_variable_request(
    hdr: &RequestHeader,
    pages_offset: usize,
    num_pages: usize,
) -> Result<(), crate::GmmError> {
    let expected = pages_offset + num_pages * core::mem::size_of::<GmmPageDesc>();
    if hdr.cb_req != expected {
        Err(crate::GmmError::InvalidParameter)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_three_sentinel_cases() {
        assert_eq!(decode_pfn_input(GC_PHYS_NONE), PfnInput::None);
        assert_eq!(decode_pfn_input(GC_PHYS_UNSHAREABLE), PfnInput::Unshareable);
        let addr = 0x1234_0000u64;
        match decode_pfn_input(addr) {
            PfnInput::Value(pfn) => assert_eq!(pfn.raw(), addr >> gmm_config::PAGE_SHIFT),
            other => panic!("expected Value, got {other:?}"),
        }
    }

    #[test]
    fn variable_request_size_must_match_trailing_array() {
        let pages_offset = 16;
        let hdr_ok = RequestHeader { cb_req: pages_offset + 3 * core::mem::size_of::<GmmPageDesc>() };
        assert!(validate_variable_request(&hdr_ok, pages_offset, 3).is_ok());
        let hdr_bad = RequestHeader { cb_req: pages_offset + 2 * core::mem::size_of::<GmmPageDesc>() };
        assert!(validate_variable_request(&hdr_bad, pages_offset, 3).is_err());
    }
}
