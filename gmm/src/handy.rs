//! The handy-page update path (§4.H): a single round trip that rewrites
//! the PFN of pages a VM already holds and releases shared-page
//! references it's done with, then allocates a fresh batch of pages in
//! the same call.
//!
//! Per-entry failures in the update half accumulate into the return
//! code (last non-success wins) but never abort processing of later
//! entries — matching the same "don't let one bad slot poison the
//! batch" treatment as the allocation-accounting fix in
//! [`crate::vm_record::ReservationTriple::credit`].

use gmm_types::VmHandle;

use crate::allocator;
use crate::descriptor::{decode_pfn_input, GmmPageDesc, PfnInput};
use crate::error::{GmmError, GmmResult};
use crate::inner::GmmInner;
use crate::policy::Account;
use gmm_host::HostPageAllocator;
use gmm_page::PageDescriptor;

/// Processes `descs[..num_updates]` as update slots (see
/// [`apply_one_update`]) and then allocates into `descs[num_updates..]`
/// as plain new pages, charged against the VM's `Base` account.
pub fn update_and_allocate(
    inner: &mut GmmInner,
    host: &dyn HostPageAllocator,
    vm: VmHandle,
    num_updates: usize,
    descs: &mut [GmmPageDesc],
) -> GmmResult<()> {
    if num_updates > descs.len() {
        return Err(GmmError::InvalidParameter);
    }

    let mut last: GmmResult<()> = Ok(());

    for slot in &mut descs[..num_updates] {
        if let Err(e) = apply_one_update(inner, vm, slot) {
            last = Err(e);
        }
    }

    let to_alloc = descs.len() - num_updates;
    if to_alloc > 0 {
        if let Err(e) = allocator::allocate_pages(inner, host, vm, to_alloc as u32, Account::Base, &mut descs[num_updates..]) {
            last = Err(e);
        }
    }

    last
}

/// One update slot (§4.H):
///
/// - If `id_page` is set, rewrite that page's stored PFN in place per
///   the three-way `hc_phys_gc_phys` rule, then clear the slot's
///   `id_page`/`hc_phys_gc_phys` to their "none" sentinels. The page
///   stays `Private` and allocated — this is a rewrite, not a retire.
/// - If `id_shared_page` is set, drop one reference; on the refcount
///   hitting zero, debit the calling VM's shared count and base
///   allocation and reclaim the page, then clear the slot's
///   `id_shared_page`.
///
/// Both steps are attempted even if one fails; the last error (if any)
/// is returned.
fn apply_one_update(inner: &mut GmmInner, vm: VmHandle, slot: &mut GmmPageDesc) -> GmmResult<()> {
    let mut last: GmmResult<()> = Ok(());

    if !slot.id_page.is_none() {
        match rewrite_private_pfn(inner, slot.id_page, slot.hc_phys_gc_phys) {
            Ok(()) => {
                slot.id_page = gmm_types::PageId::NONE;
                slot.hc_phys_gc_phys = crate::descriptor::GC_PHYS_NONE;
            }
            Err(e) => last = Err(e),
        }
    }

    if !slot.id_shared_page.is_none() {
        match release_shared_reference(inner, vm, slot.id_shared_page) {
            Ok(()) => slot.id_shared_page = gmm_types::PageId::NONE,
            Err(e) => last = Err(e),
        }
    }

    last
}

/// Looks up an existing `Private` page and overwrites its stored PFN
/// according to the three-way `hc_phys_gc_phys` rule, without touching
/// any allocation counters — the page remains allocated to whichever VM
/// already owns it.
fn rewrite_private_pfn(inner: &mut GmmInner, page_id: gmm_types::PageId, raw_pfn_input: u64) -> GmmResult<()> {
    let (chunk_id, index) = page_id.decompose();
    let chunk = inner.store.lookup_mut(chunk_id).ok_or(GmmError::PageNotFound)?;
    let desc = chunk.page(index as u32);
    if !desc.is_private() {
        return Err(GmmError::PageNotPrivate);
    }
    let owner = desc.read_owner();
    match decode_pfn_input(raw_pfn_input) {
        PfnInput::Value(pfn) => chunk.set_page(index as u32, PageDescriptor::make_private(owner, pfn)),
        PfnInput::Unshareable => {
            chunk.set_page(index as u32, PageDescriptor::make_private(owner, gmm_types::Pfn::UNSHAREABLE))
        }
        PfnInput::None => {}
    }
    Ok(())
}

/// Drops one reference from a shared page on behalf of `vm`. On the
/// refcount reaching zero, debits `vm`'s shared count and base
/// allocation and reclaims the page via [`allocator::free_shared_page`].
fn release_shared_reference(inner: &mut GmmInner, vm: VmHandle, page_id: gmm_types::PageId) -> GmmResult<()> {
    let remaining_refs = allocator::free_shared_page(inner, page_id)?;
    if remaining_refs == 0 {
        let rec = inner.vm_records.get_mut(&vm).ok_or(GmmError::InvalidParameter)?;
        rec.shared_count = rec.shared_count.saturating_sub(1);
        rec.allocated.base = rec.allocated.base.saturating_sub(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_record::{ReservationTriple, VmRecord};
    use gmm_chunk::Pool;
    use gmm_host::testing::FakeHostAllocator;
    use gmm_types::PageId;

    fn new_inner_with_vm(max_pages: u64) -> GmmInner {
        let mut inner = GmmInner::new(max_pages, false);
        inner.vm_records.insert(VmHandle::new(1), VmRecord {
            reservation: ReservationTriple::new(10_000, 0, 0),
            may_allocate: true,
            ..Default::default()
        });
        inner
    }

    #[test]
    fn pure_allocation_batch_fills_every_slot() {
        let mut inner = new_inner_with_vm(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);
        let mut descs = [GmmPageDesc::empty(); 4];
        update_and_allocate(&mut inner, &host, vm, 0, &mut descs).unwrap();
        for d in &descs {
            assert_ne!(d.hc_phys_gc_phys, crate::descriptor::GC_PHYS_NONE);
        }
        assert_eq!(inner.allocated_pages, 4);
    }

    #[test]
    fn update_slot_rewrites_the_pfn_without_retiring_the_page() {
        let mut inner = new_inner_with_vm(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);

        let mut first = [GmmPageDesc::empty()];
        update_and_allocate(&mut inner, &host, vm, 0, &mut first).unwrap();
        let page_id = first[0].id_page;
        assert_eq!(inner.allocated_pages, 1);

        let new_gc_phys = 0x9000_0000u64;
        let mut second = [GmmPageDesc { hc_phys_gc_phys: new_gc_phys, id_page: page_id, id_shared_page: PageId::NONE }];
        update_and_allocate(&mut inner, &host, vm, 1, &mut second).unwrap();

        // Nothing was retired or reallocated by the update half alone.
        assert_eq!(inner.allocated_pages, 1);
        assert_eq!(second[0].id_page, PageId::NONE, "update slot is zeroed after being applied");

        let (chunk_id, index) = page_id.decompose();
        let desc = inner.store.lookup(chunk_id).unwrap().page(index as u32);
        assert!(desc.is_private());
        assert_eq!(desc.read_pfn().raw(), new_gc_phys >> gmm_config::PAGE_SHIFT);
    }

    #[test]
    fn update_slot_releasing_the_last_shared_reference_debits_the_vm() {
        let mut inner = new_inner_with_vm(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);

        // Manufacture a shared page directly: allocate a private page,
        // then convert it so there is something to release a reference
        // from.
        let mut alloc_out = [GmmPageDesc::empty()];
        update_and_allocate(&mut inner, &host, vm, 0, &mut alloc_out).unwrap();
        let (chunk_id, index) = alloc_out[0].id_page.decompose();
        {
            let chunk = inner.store.lookup_mut(chunk_id).unwrap();
            chunk.convert_private_to_shared(index as u32);
        }
        inner.shared_pages += 1;
        if let Some(rec) = inner.vm_records.get_mut(&vm) {
            rec.shared_count += 1;
        }

        let shared_id = alloc_out[0].id_page;
        let mut update = [GmmPageDesc { hc_phys_gc_phys: crate::descriptor::GC_PHYS_NONE, id_page: PageId::NONE, id_shared_page: shared_id }];
        update_and_allocate(&mut inner, &host, vm, 1, &mut update).unwrap();

        assert_eq!(update[0].id_shared_page, PageId::NONE);
        assert_eq!(inner.shared_pages, 0);
        assert_eq!(inner.vm_records.get(&vm).unwrap().shared_count, 0);
        let chunk = inner.store.lookup(chunk_id).unwrap();
        assert_eq!(chunk.pool(), Some(Pool::Private));
    }

    #[test]
    fn a_bad_update_slot_does_not_block_the_rest_of_the_batch() {
        let mut inner = new_inner_with_vm(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);

        let bogus_page = PageId::from_raw(0xDEAD_0001);
        let mut descs = [
            GmmPageDesc { hc_phys_gc_phys: crate::descriptor::GC_PHYS_NONE, id_page: bogus_page, id_shared_page: PageId::NONE },
            GmmPageDesc::empty(),
        ];
        let err = update_and_allocate(&mut inner, &host, vm, 1, &mut descs).unwrap_err();
        assert_eq!(err, GmmError::PageNotFound);
        // The trailing allocation slot still got a fresh page despite
        // slot 0's bad update.
        assert_ne!(descs[1].hc_phys_gc_phys, crate::descriptor::GC_PHYS_NONE);
    }
}
