//! The page allocator (§4.F): the hard part. Turns a page count into a
//! run of freshly-`Private` pages, growing the free set from the host
//! when the existing chunks can't cover the request, and the mirror
//! operation that reclaims a page back onto a chunk's free LIFO.

use gmm_config::{BUCKET_COUNT, CHUNK_NUM_PAGES};
use gmm_chunk::Pool;
use gmm_page::{host_phys_addr_of, PageDescriptor};
use gmm_types::{ChunkId, PageId, Pfn, VmHandle};

use crate::descriptor::{decode_pfn_input, GmmPageDesc, PfnInput};
use crate::error::{GmmError, GmmResult};
use crate::inner::GmmInner;
use crate::lifecycle;
use crate::policy::Account;
use gmm_host::HostPageAllocator;

/// Allocates `pages` fresh private pages for `vm`, charging `account`,
/// and writes one [`GmmPageDesc`] per page into `descs[..pages]`.
///
/// Per §4.F: limit checks, then a supply check that may grow the set,
/// then (in legacy mode) an affinity check, then the two-pass
/// bucket-ascending scan that actually claims pages.
pub fn allocate_pages(
    inner: &mut GmmInner,
    host: &dyn HostPageAllocator,
    vm: VmHandle,
    pages: u32,
    account: Account,
    descs: &mut [GmmPageDesc],
) -> GmmResult<()> {
    if pages == 0 {
        return Ok(());
    }
    if descs.len() < pages as usize {
        return Err(GmmError::InvalidParameter);
    }

    if inner.allocated_pages + pages as u64 > inner.max_pages {
        return Err(GmmError::HitGlobalLimit);
    }

    {
        let rec = inner.vm_records.get(&vm).ok_or(GmmError::InvalidParameter)?;
        if !rec.may_allocate {
            return Err(GmmError::WrongOrder);
        }
        let have = rec.allocated.get(account) as u64;
        let limit = rec.reservation.get(account) as u64;
        if have + pages as u64 > limit {
            return Err(GmmError::HitVmAccountLimit);
        }
    }

    if inner.legacy_mode {
        if inner.free_private.total_free_pages() < pages as u64 {
            return Err(GmmError::SeedMe);
        }
        let mut vm_free = 0u64;
        inner.store.foreach(|c| {
            if c.affinity() == Some(vm) {
                vm_free += c.free_count() as u64;
            }
        });
        if vm_free < pages as u64 {
            return Err(GmmError::SeedMe);
        }
    } else {
        // Growing against the total free count alone would let the
        // fallback pass below satisfy this request out of some other
        // VM's already-affinitized chunk. Grow against what's actually
        // safe for `vm` to draw from instead: its own chunks plus any
        // chunk no VM has touched yet.
        ensure_affinity_supply(inner, host, vm, pages as u64)?;
    }

    let mut remaining = pages;
    let mut out = 0usize;
    for bucket in 0..BUCKET_COUNT {
        if remaining == 0 {
            break;
        }
        remaining = drain_bucket(inner, bucket, vm, remaining, descs, &mut out, Pass::Affinity);
        if remaining == 0 {
            break;
        }
        if !inner.legacy_mode {
            remaining = drain_bucket(inner, bucket, vm, remaining, descs, &mut out, Pass::Fallback);
        }
    }

    if remaining != 0 {
        // The supply check above guaranteed enough total free pages; if
        // the scan still came up short, the free set's bookkeeping has
        // diverged from the chunks it tracks.
        return Err(GmmError::InternalError);
    }

    let rec = inner.vm_records.get_mut(&vm).expect("checked present above");
    rec.allocated.credit(account, pages);
    rec.private_count += pages;
    inner.allocated_pages += pages as u64;

    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Only chunks already carrying this VM's affinity (or, in legacy
    /// mode, any of the caller's chunks regardless of how full they are).
    Affinity,
    /// Any chunk this VM is allowed to touch that the affinity pass
    /// didn't already claim: one of its own, or one no VM has touched yet
    /// (claiming its affinity on first pop). Never a chunk another VM
    /// already has affinity for. Skipped entirely in legacy mode.
    Fallback,
}

fn drain_bucket(
    inner: &mut GmmInner,
    bucket: usize,
    vm: VmHandle,
    mut remaining: u32,
    descs: &mut [GmmPageDesc],
    out: &mut usize,
    pass: Pass,
) -> u32 {
    if remaining == 0 {
        return 0;
    }
    let snapshot = inner.free_private.snapshot_bucket(&inner.store, bucket);
    for chunk_id in snapshot {
        if remaining == 0 {
            break;
        }
        let Some(chunk) = inner.store.peek(chunk_id) else { continue };
        let eligible = match pass {
            Pass::Affinity => {
                chunk.affinity() == Some(vm)
                    && (inner.legacy_mode || chunk.free_count() < CHUNK_NUM_PAGES as u32)
            }
            Pass::Fallback => {
                let affinity = chunk.affinity();
                affinity.is_none() || affinity == Some(vm)
            }
        };
        if !eligible {
            continue;
        }
        remaining = drain_chunk_into(inner, chunk_id, vm, remaining, descs, out);
    }
    remaining
}

/// Unlinks `chunk_id`, pops up to `remaining` free pages from it into
/// `descs[*out..]`, and re-links it if anything is left free.
fn drain_chunk_into(
    inner: &mut GmmInner,
    chunk_id: ChunkId,
    vm: VmHandle,
    mut remaining: u32,
    descs: &mut [GmmPageDesc],
    out: &mut usize,
) -> u32 {
    {
        let (set, store) = inner.free_set_and_store(Pool::Private);
        set.unlink(store, chunk_id);
    }

    while remaining > 0 {
        let chunk = inner.store.lookup_mut(chunk_id).expect("just unlinked it");
        if chunk.free_count() == 0 {
            break;
        }
        let pfn = match decode_pfn_input(descs[*out].hc_phys_gc_phys) {
            PfnInput::Value(p) if p.is_valid() => p,
            _ => Pfn::UNSHAREABLE,
        };
        let index = chunk.allocate_one_private(vm, pfn).expect("free_count() > 0 checked above");
        let host_addr = host_phys_addr_of(chunk.host_base(), index as usize);
        descs[*out] = GmmPageDesc {
            hc_phys_gc_phys: host_addr.raw(),
            id_page: PageId::compose(chunk_id, index as usize),
            id_shared_page: PageId::NONE,
        };
        *out += 1;
        remaining -= 1;
    }

    if inner.store.lookup(chunk_id).expect("still in the store").free_count() > 0 {
        let (set, store) = inner.free_set_and_store(Pool::Private);
        set.link(store, chunk_id);
    }

    remaining
}

/// Grows the private set until `vm` has at least `need` free pages it can
/// safely draw from without the fallback pass reaching into another VM's
/// chunk: its own affinity chunks, plus any chunk no VM has touched yet.
/// Steals fully-free chunks out of the shared set first, then creates
/// brand-new chunks via the host allocator (§4.F "grow the set").
fn ensure_affinity_supply(inner: &mut GmmInner, host: &dyn HostPageAllocator, vm: VmHandle, need: u64) -> GmmResult<()> {
    loop {
        if affinity_and_virgin_free(inner, vm) >= need {
            return Ok(());
        }
        if !steal_fully_free_chunk(inner, Pool::Shared, Pool::Private) {
            lifecycle::create_chunk(inner, host, Pool::Private)?;
        }
    }
}

/// Sum of free pages across chunks `vm` may draw from without
/// cannibalizing another VM's chunk: its own affinity chunks, and any
/// chunk that has never had a page popped from it (affinity `None`,
/// hence fully free).
fn affinity_and_virgin_free(inner: &GmmInner, vm: VmHandle) -> u64 {
    let mut total = 0u64;
    inner.store.foreach(|c| {
        if c.pool() == Some(Pool::Private) {
            let affinity = c.affinity();
            if affinity.is_none() || affinity == Some(vm) {
                total += c.free_count() as u64;
            }
        }
    });
    total
}

/// Moves one fully-free chunk from `from`'s top bucket into `to`, if one
/// exists. Returns whether a chunk was actually moved.
fn steal_fully_free_chunk(inner: &mut GmmInner, from: Pool, to: Pool) -> bool {
    let top_bucket = BUCKET_COUNT - 1;
    let candidate = inner
        .free_set_ref(from)
        .snapshot_bucket(&inner.store, top_bucket)
        .into_iter()
        .find(|&id| inner.store.peek(id).map(|c| c.is_fully_free()).unwrap_or(false));

    let Some(id) = candidate else { return false };
    {
        let (set, store) = inner.free_set_and_store(from);
        set.unlink(store, id);
    }
    let (set, store) = inner.free_set_and_store(to);
    set.link(store, id);
    true
}

/// Reclaims a `Private` page at `page_id` back onto its chunk's free
/// LIFO (§4.F "free one page"). Verifies the page is actually `Private`
/// and owned by `vm` first.
pub fn free_one_page(inner: &mut GmmInner, host: &dyn HostPageAllocator, vm: VmHandle, page_id: PageId) -> GmmResult<()> {
    if page_id.is_none() {
        return Err(GmmError::InvalidParameter);
    }
    let (chunk_id, index) = page_id.decompose();
    let chunk = inner.store.lookup_mut(chunk_id).ok_or(GmmError::PageNotFound)?;
    let desc: PageDescriptor = chunk.page(index as u32);
    if !desc.is_private() {
        return Err(GmmError::PageNotPrivate);
    }
    if desc.read_owner() != vm {
        return Err(GmmError::PageNotFound);
    }

    let pool = chunk.pool();
    if let Some(pool) = pool {
        let (set, store) = inner.free_set_and_store(pool);
        set.unlink(store, chunk_id);
    }

    let chunk = inner.store.lookup_mut(chunk_id).expect("looked up above");
    chunk.free_private_page(index as u32);
    let now_fully_free = chunk.is_fully_free();
    let relink_pool = if chunk.shared_count() > 0 { Pool::Shared } else { Pool::Private };

    let rec = inner.vm_records.get_mut(&vm).ok_or(GmmError::InvalidParameter)?;
    rec.private_count = rec.private_count.saturating_sub(1);
    inner.allocated_pages = inner.allocated_pages.saturating_sub(1);

    if now_fully_free && inner.chunk_count > 1 {
        // Give the chunk back to the host rather than re-linking it, as
        // long as it isn't the last chunk in the system (keeping one
        // around avoids immediately re-growing on the very next
        // allocation).
        lifecycle::release_chunk(inner, host, &NoopVmCollaborator, chunk_id)?;
    } else {
        // Re-link in the set matching what the chunk actually holds now
        // (§4.F): shared if any shared pages remain, else private.
        let (set, store) = inner.free_set_and_store(relink_pool);
        set.link(store, chunk_id);
    }

    Ok(())
}

/// A do-nothing [`gmm_host::VmCollaborator`] used by [`free_one_page`]'s
/// opportunistic chunk release: a page-level free never has live
/// mappings to unmap (the caller just retired the one page keeping the
/// chunk non-empty), so there is nothing to post.
struct NoopVmCollaborator;

impl gmm_host::VmCollaborator for NoopVmCollaborator {
    fn request_unmap(&self, _vm: VmHandle, _chunk: ChunkId, _user_address: usize) {}
}

/// Drops one reference from a `Shared` page, reclaiming it onto its
/// chunk's free LIFO once the refcount reaches zero. Guest page sharing
/// itself is reserved (§1, §9); this exists so the handy-page update
/// path (§4.H) has a counterpart for releasing a previously-shared page.
pub fn free_shared_page(inner: &mut GmmInner, page_id: PageId) -> GmmResult<u64> {
    if page_id.is_none() {
        return Err(GmmError::InvalidParameter);
    }
    let (chunk_id, index) = page_id.decompose();
    let chunk = inner.store.lookup_mut(chunk_id).ok_or(GmmError::PageNotFound)?;
    let mut desc = chunk.page(index as u32);
    if !desc.is_shared() {
        return Err(GmmError::PageNotShared);
    }
    let remaining_refs = desc.decref();
    chunk.set_page(index as u32, desc);

    if remaining_refs == 0 {
        let was_linked = chunk.is_linked();
        if was_linked {
            let (set, store) = inner.free_set_and_store(Pool::Shared);
            set.unlink(store, chunk_id);
        }
        let chunk = inner.store.lookup_mut(chunk_id).expect("looked up above");
        chunk.free_shared_page(index as u32);
        inner.shared_pages = inner.shared_pages.saturating_sub(1);
        inner.allocated_pages = inner.allocated_pages.saturating_sub(1);

        let (set, store) = inner.free_set_and_store(Pool::Shared);
        set.link(store, chunk_id);
    }

    Ok(remaining_refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmm_host::testing::FakeHostAllocator;

    fn new_inner(max_pages: u64) -> GmmInner {
        let mut inner = GmmInner::new(max_pages, false);
        inner.vm_records.insert(VmHandle::new(1), crate::vm_record::VmRecord {
            reservation: crate::vm_record::ReservationTriple::new(10_000, 0, 0),
            may_allocate: true,
            ..Default::default()
        });
        inner
    }

    fn descs(n: usize) -> alloc::vec::Vec<GmmPageDesc> {
        alloc::vec![GmmPageDesc::empty(); n]
    }

    extern crate alloc;

    #[test]
    fn allocate_grows_the_set_from_empty_and_returns_distinct_pages() {
        let mut inner = new_inner(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);
        let mut out = descs(10);
        allocate_pages(&mut inner, &host, vm, 10, Account::Base, &mut out).unwrap();

        assert_eq!(inner.allocated_pages, 10);
        let mut seen = alloc::collections::BTreeSet::new();
        for d in &out {
            assert!(seen.insert(d.id_page.raw()), "duplicate page id handed out");
            assert_ne!(d.hc_phys_gc_phys, crate::descriptor::GC_PHYS_NONE);
        }
    }

    #[test]
    fn allocate_respects_the_account_limit() {
        let mut inner = new_inner(1_000_000);
        inner.vm_records.get_mut(&VmHandle::new(1)).unwrap().reservation =
            crate::vm_record::ReservationTriple::new(5, 0, 0);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);
        let mut out = descs(6);
        let err = allocate_pages(&mut inner, &host, vm, 6, Account::Base, &mut out).unwrap_err();
        assert_eq!(err, GmmError::HitVmAccountLimit);
    }

    #[test]
    fn allocate_respects_the_global_limit() {
        let mut inner = new_inner(4);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);
        let mut out = descs(5);
        let err = allocate_pages(&mut inner, &host, vm, 5, Account::Base, &mut out).unwrap_err();
        assert_eq!(err, GmmError::HitGlobalLimit);
    }

    #[test]
    fn allocate_and_free_round_trip_returns_the_chunk_to_the_host() {
        let mut inner = new_inner(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);
        let mut out = descs(1);
        allocate_pages(&mut inner, &host, vm, 1, Account::Base, &mut out).unwrap();
        assert_eq!(inner.chunk_count, 1);

        free_one_page(&mut inner, &host, vm, out[0].id_page).unwrap();
        assert_eq!(inner.allocated_pages, 0);
        // The only chunk in the system is kept rather than released.
        assert_eq!(inner.chunk_count, 1);
    }

    #[test]
    fn free_releases_a_fully_freed_chunk_when_another_remains() {
        let mut inner = new_inner(1_000_000);
        let host = FakeHostAllocator::new(true);
        let vm = VmHandle::new(1);

        // Force two chunks to exist by allocating more than one chunk's
        // worth of pages, then freeing all of the first chunk's pages.
        let total = gmm_config::CHUNK_NUM_PAGES as u32 + 1;
        let mut out = descs(total as usize);
        allocate_pages(&mut inner, &host, vm, total, Account::Base, &mut out).unwrap();
        assert_eq!(inner.chunk_count, 2);

        for d in out.iter().take(gmm_config::CHUNK_NUM_PAGES) {
            free_one_page(&mut inner, &host, vm, d.id_page).unwrap();
        }
        assert_eq!(inner.chunk_count, 1);
    }

    #[test]
    fn allocate_does_not_cannibalize_another_vms_affinity_chunk() {
        let mut inner = new_inner(1_000_000);
        inner.vm_records.insert(VmHandle::new(2), crate::vm_record::VmRecord {
            reservation: crate::vm_record::ReservationTriple::new(10_000, 0, 0),
            may_allocate: true,
            ..Default::default()
        });
        let host = FakeHostAllocator::new(true);
        let v1 = VmHandle::new(1);
        let v2 = VmHandle::new(2);

        // v1 takes part of a chunk, leaving plenty of free pages in it —
        // enough that a plain total-free-pages check would think v2's
        // request is already covered.
        let mut out1 = descs(64);
        allocate_pages(&mut inner, &host, v1, 64, Account::Base, &mut out1).unwrap();

        let mut out2 = descs(64);
        allocate_pages(&mut inner, &host, v2, 64, Account::Base, &mut out2).unwrap();

        let chunk1 = out1[0].id_page.decompose().0;
        let chunk2 = out2[0].id_page.decompose().0;
        assert_ne!(chunk1, chunk2, "v2 must not draw pages out of v1's chunk");
        for d in &out2 {
            assert_ne!(d.id_page.decompose().0, chunk1);
        }
    }

    #[test]
    fn legacy_mode_refuses_to_grow_and_reports_seed_me() {
        let mut inner = GmmInner::new(1_000_000, true);
        inner.vm_records.insert(VmHandle::new(1), crate::vm_record::VmRecord {
            reservation: crate::vm_record::ReservationTriple::new(10_000, 0, 0),
            may_allocate: true,
            ..Default::default()
        });
        let host = FakeHostAllocator::new(false);
        let vm = VmHandle::new(1);
        let mut out = descs(1);
        let err = allocate_pages(&mut inner, &host, vm, 1, Account::Base, &mut out).unwrap_err();
        assert_eq!(err, GmmError::SeedMe);
    }
}
