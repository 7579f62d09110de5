//! The public engine (§6): one process-wide [`Gmm`] guarded by a single
//! mutex, exposing the VM lifecycle, reservation, and allocation entry
//! points. Every per-VM call first checks the caller's [`ThreadId`]
//! against the VM's designated owner (§5).

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;

use gmm_chunk::Pool;
use gmm_config::CHUNK_NUM_PAGES;
use gmm_types::{ChunkId, PageId, Pfn, VmHandle};

use crate::allocator;
use crate::descriptor::GmmPageDesc;
use crate::error::{GmmError, GmmResult};
use crate::handy;
use crate::inner::GmmInner;
use crate::lifecycle;
use crate::policy::{Account, OomPriority, OverCommitPolicy};
use crate::vm_record::{ReservationTriple, VmRecord};
use gmm_host::{HostPageAllocator, ThreadId, VmCollaborator};

/// The Global Memory Manager. One instance is created at host-boot time
/// via [`Gmm::init`] and shared for the rest of the process's lifetime;
/// every operation serializes on `inner`'s mutex (§1, §5: "a single
/// coarse-grained lock guards all of the GMM's state").
pub struct Gmm {
    inner: spin::Mutex<GmmInner>,
    host: Box<dyn HostPageAllocator>,
    vm_collaborator: Box<dyn VmCollaborator>,
}

impl Gmm {
    /// Brings up the GMM singleton. Probes the host's non-contiguous
    /// allocation support exactly once here and latches the result as
    /// legacy mode for the rest of the process (§4.B, §9).
    pub fn init(max_pages: u64, host: Box<dyn HostPageAllocator>, vm_collaborator: Box<dyn VmCollaborator>) -> Self {
        let legacy_mode = !host.probe_supports_noncontiguous();
        log::info!("gmm: init (max_pages={max_pages}, legacy_mode={legacy_mode})");
        Gmm { inner: spin::Mutex::new(GmmInner::new(max_pages, legacy_mode)), host, vm_collaborator }
    }

    /// Tears the GMM down. Refuses while any VM is still registered,
    /// mirroring the requirement that every VM runs `cleanup_vm` first.
    pub fn term(&self) -> GmmResult<()> {
        let inner = self.inner.lock();
        if inner.registered_vm_count != 0 {
            return Err(GmmError::WrongOrder);
        }
        Ok(())
    }

    /// Registers a new VM under its lifecycle manager's designated
    /// owner thread. Every later per-VM call must come from that same
    /// thread (§5).
    pub fn init_per_vm(&self, vm: VmHandle, owner: ThreadId) -> GmmResult<()> {
        let mut inner = self.inner.lock();
        if inner.vm_records.contains_key(&vm) {
            return Err(GmmError::WrongOrder);
        }
        let mut rec = VmRecord::new();
        rec.owner_thread = Some(owner);
        inner.vm_records.insert(vm, rec);
        inner.registered_vm_count += 1;
        Ok(())
    }

    /// Tears down one VM's bookkeeping: reclaims every private page it
    /// still owns, unregisters it, and — if it was the last VM standing
    /// — walks the whole chunk store returning every chunk's memory to
    /// the host rather than leaving it linked for nobody.
    ///
    /// The reference source's equivalent of the page-reclaim walk below
    /// sits behind a dead `if (0)` branch and never runs; here it always
    /// runs (§9).
    pub fn cleanup_vm(&self, vm: VmHandle, owner: ThreadId) -> GmmResult<()> {
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;

        let owned_pages = collect_private_pages_owned_by(&inner, vm);
        for page_id in owned_pages {
            if let Err(e) = allocator::free_one_page(&mut inner, self.host.as_ref(), vm, page_id) {
                log::warn!("gmm: cleanup_vm({vm}) failed to reclaim {page_id}: {e}");
            }
        }

        inner.vm_records.remove(&vm);
        inner.registered_vm_count = inner.registered_vm_count.saturating_sub(1);

        if inner.registered_vm_count == 0 {
            let ids: Vec<ChunkId> = inner.store.ids().collect();
            for id in ids {
                if let Err(e) = lifecycle::release_chunk(&mut inner, self.host.as_ref(), self.vm_collaborator.as_ref(), id) {
                    log::warn!("gmm: cleanup_vm: failed to release chunk {id} on last-VM teardown: {e}");
                }
            }
        }

        Ok(())
    }

    /// Establishes a VM's reservation for the first time. Must run
    /// exactly once per VM, before any allocation.
    pub fn initial_reservation(
        &self,
        vm: VmHandle,
        owner: ThreadId,
        reservation: ReservationTriple,
        policy: OverCommitPolicy,
        priority: OomPriority,
    ) -> GmmResult<()> {
        if !policy.is_valid() || !priority.is_valid() {
            return Err(GmmError::InvalidParameter);
        }
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;
        if inner.vm_records.get(&vm).expect("checked by check_owner").may_allocate {
            return Err(GmmError::WrongOrder);
        }

        inner.reserved_pages += reservation.sum();
        inner.over_committed_pages = inner.reserved_pages.saturating_sub(inner.max_pages);

        let rec = inner.vm_records.get_mut(&vm).expect("checked above");
        rec.reservation = reservation;
        rec.policy = policy;
        rec.priority = priority;
        rec.may_allocate = true;
        Ok(())
    }

    /// Adjusts an already-reserved VM's reservation. Refuses to drop an
    /// account below what's already allocated against it.
    pub fn update_reservation(&self, vm: VmHandle, owner: ThreadId, reservation: ReservationTriple) -> GmmResult<()> {
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;
        let rec = inner.vm_records.get(&vm).expect("checked above");
        if !rec.may_allocate {
            return Err(GmmError::WrongOrder);
        }
        for account in [Account::Base, Account::Shadow, Account::Fixed] {
            if reservation.get(account) < rec.allocated.get(account) {
                return Err(GmmError::HitVmAccountLimit);
            }
        }

        let old_sum = rec.reservation.sum();
        let new_sum = reservation.sum();
        inner.reserved_pages = inner.reserved_pages - old_sum + new_sum;
        inner.over_committed_pages = inner.reserved_pages.saturating_sub(inner.max_pages);

        let rec = inner.vm_records.get_mut(&vm).expect("checked above");
        rec.reservation = reservation;
        Ok(())
    }

    /// Allocates `descs.len()` fresh private pages for `vm`, charged
    /// against `account` (§4.F).
    pub fn allocate_pages(&self, vm: VmHandle, owner: ThreadId, account: Account, descs: &mut [GmmPageDesc]) -> GmmResult<()> {
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;
        let pages = descs.len() as u32;
        allocator::allocate_pages(&mut inner, self.host.as_ref(), vm, pages, account, descs)
    }

    /// The combined update-and-allocate round trip (§4.H).
    pub fn allocate_handy_pages(&self, vm: VmHandle, owner: ThreadId, num_updates: usize, descs: &mut [GmmPageDesc]) -> GmmResult<()> {
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;
        handy::update_and_allocate(&mut inner, self.host.as_ref(), vm, num_updates, descs)
    }

    /// Retires a batch of private pages without replacing them.
    pub fn free_pages(&self, vm: VmHandle, owner: ThreadId, page_ids: &[PageId]) -> GmmResult<()> {
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;
        let mut last: GmmResult<()> = Ok(());
        for &id in page_ids {
            if let Err(e) = allocator::free_one_page(&mut inner, self.host.as_ref(), vm, id) {
                last = Err(e);
            }
        }
        last
    }

    /// Guest balloon inflate/deflate notifications: reserved, not
    /// implemented (§1, §9 — enforcement beyond reservation arithmetic
    /// is out of scope).
    pub fn ballooned_pages(&self, _vm: VmHandle, _owner: ThreadId) -> GmmResult<()> {
        Err(GmmError::NotImplemented)
    }

    /// Chunk map/unmap into a VM's user-space address space: reserved,
    /// not implemented (§1, §9).
    pub fn free_map_unmap_chunk(&self, _vm: VmHandle, _owner: ThreadId, _chunk: ChunkId) -> GmmResult<()> {
        Err(GmmError::NotImplemented)
    }

    /// Legacy-mode-only: seeds one whole chunk's worth of pages directly
    /// from a VM-supplied PFN list, bypassing the ordinary allocator
    /// because legacy hosts can't hand the GMM non-contiguous memory to
    /// grow its own free set with (§4.B, §9).
    pub fn seed_chunk(&self, vm: VmHandle, owner: ThreadId, pfns: &[Pfn]) -> GmmResult<ChunkId> {
        if pfns.len() != CHUNK_NUM_PAGES {
            return Err(GmmError::InvalidParameter);
        }
        let mut inner = self.inner.lock();
        check_owner(&inner, vm, owner)?;
        if !inner.legacy_mode {
            return Err(GmmError::InvalidParameter);
        }

        let id = lifecycle::create_chunk(&mut inner, self.host.as_ref(), Pool::Private)?;
        {
            let (set, store) = inner.free_set_and_store(Pool::Private);
            set.unlink(store, id);
        }
        let chunk = inner.store.lookup_mut(id).expect("just created");
        for &pfn in pfns {
            chunk.allocate_one_private(vm, pfn).expect("a freshly created chunk has 256 free pages");
        }

        inner.allocated_pages += CHUNK_NUM_PAGES as u64;
        let rec = inner.vm_records.get_mut(&vm).expect("checked by check_owner");
        rec.allocated.credit(Account::Base, CHUNK_NUM_PAGES as u32);
        rec.private_count += CHUNK_NUM_PAGES as u32;

        Ok(id)
    }
}

fn check_owner(inner: &GmmInner, vm: VmHandle, owner: ThreadId) -> GmmResult<()> {
    let rec = inner.vm_records.get(&vm).ok_or(GmmError::InvalidParameter)?;
    match rec.owner_thread {
        Some(t) if t == owner => Ok(()),
        _ => Err(GmmError::NotOwner),
    }
}

/// Walks every chunk looking for `Private` pages owned by `vm`. Linear
/// in total page count; only used on the (cold) VM-teardown path.
fn collect_private_pages_owned_by(inner: &GmmInner, vm: VmHandle) -> Vec<PageId> {
    let mut out = Vec::new();
    for chunk_id in inner.store.ids() {
        let Some(chunk) = inner.store.peek(chunk_id) else { continue };
        for index in 0..CHUNK_NUM_PAGES as u32 {
            let desc = chunk.page(index);
            if desc.is_private() && desc.read_owner() == vm {
                out.push(PageId::compose(chunk_id, index as usize));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmm_host::testing::{FakeHostAllocator, RecordingVmCollaborator};

    fn gmm_for_test(max_pages: u64) -> Gmm {
        Gmm::init(max_pages, Box::new(FakeHostAllocator::new(true)), Box::new(RecordingVmCollaborator::new()))
    }

    /// S1: a VM registers, reserves, allocates, then cleans up, leaving
    /// the global counters back at zero.
    #[test]
    fn single_vm_allocate_and_cleanup_cycle() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(42);

        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(
            vm,
            owner,
            ReservationTriple::new(100, 0, 0),
            OverCommitPolicy::NoOverCommit,
            OomPriority::Normal,
        )
        .unwrap();

        let mut descs = [GmmPageDesc::empty(); 10];
        gmm.allocate_pages(vm, owner, Account::Base, &mut descs).unwrap();
        assert_eq!(gmm.inner.lock().allocated_pages, 10);

        gmm.cleanup_vm(vm, owner).unwrap();
        assert_eq!(gmm.inner.lock().allocated_pages, 0);
        assert_eq!(gmm.inner.lock().registered_vm_count, 0);
        // Last VM gone: every chunk's memory must have gone back to the host.
        assert_eq!(gmm.inner.lock().chunk_count, 0);
    }

    #[test]
    fn calls_from_the_wrong_thread_are_rejected() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        gmm.init_per_vm(vm, ThreadId::new(1)).unwrap();

        let err = gmm
            .initial_reservation(vm, ThreadId::new(2), ReservationTriple::new(10, 0, 0), OverCommitPolicy::NoOverCommit, OomPriority::Normal)
            .unwrap_err();
        assert_eq!(err, GmmError::NotOwner);
    }

    #[test]
    fn allocation_before_reservation_is_wrong_order() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();

        let mut descs = [GmmPageDesc::empty(); 1];
        let err = gmm.allocate_pages(vm, owner, Account::Base, &mut descs).unwrap_err();
        assert_eq!(err, GmmError::WrongOrder);
    }

    /// S3: a reservation's account limit is enforced even though the
    /// global limit has plenty of headroom.
    #[test]
    fn account_limit_enforced_independent_of_global_limit() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(5, 0, 0), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let mut descs = [GmmPageDesc::empty(); 6];
        let err = gmm.allocate_pages(vm, owner, Account::Base, &mut descs).unwrap_err();
        assert_eq!(err, GmmError::HitVmAccountLimit);
    }

    #[test]
    fn update_reservation_refuses_to_drop_below_allocated() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(100, 0, 0), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let mut descs = [GmmPageDesc::empty(); 10];
        gmm.allocate_pages(vm, owner, Account::Base, &mut descs).unwrap();

        let err = gmm.update_reservation(vm, owner, ReservationTriple::new(5, 0, 0)).unwrap_err();
        assert_eq!(err, GmmError::HitVmAccountLimit);
    }

    #[test]
    fn legacy_mode_seed_chunk_assigns_every_page_to_the_seeding_vm() {
        let gmm = Gmm::init(1_000_000, Box::new(FakeHostAllocator::new(false)), Box::new(RecordingVmCollaborator::new()));
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(10_000, 0, 0), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let pfns: Vec<Pfn> = (0..CHUNK_NUM_PAGES as u64).map(Pfn::new_unchecked).collect();
        let chunk_id = gmm.seed_chunk(vm, owner, &pfns).unwrap();

        let inner = gmm.inner.lock();
        assert_eq!(inner.store.peek(chunk_id).unwrap().private_count() as usize, CHUNK_NUM_PAGES);
        assert_eq!(inner.store.peek(chunk_id).unwrap().affinity(), Some(vm));
    }

    #[test]
    fn non_legacy_host_refuses_seed_chunk() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(10_000, 0, 0), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let pfns = alloc::vec![Pfn::new_unchecked(0); CHUNK_NUM_PAGES];
        let err = gmm.seed_chunk(vm, owner, &pfns).unwrap_err();
        assert_eq!(err, GmmError::InvalidParameter);
    }

    #[test]
    fn reserved_operations_report_not_implemented() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        assert_eq!(gmm.ballooned_pages(vm, owner).unwrap_err(), GmmError::NotImplemented);
        assert_eq!(gmm.free_map_unmap_chunk(vm, owner, ChunkId::new(1)).unwrap_err(), GmmError::NotImplemented);
    }

    /// S1 (single-VM allocate/free cycle), exercised through the handy-page
    /// path rather than the bare allocator: zero updates, 64 fresh pages,
    /// all landing in one chunk.
    #[test]
    fn s1_handy_pages_with_no_updates_fills_one_chunk() {
        let gmm = gmm_for_test(1_024);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(256, 64, 16), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let mut descs = [GmmPageDesc::empty(); 64];
        gmm.allocate_handy_pages(vm, owner, 0, &mut descs).unwrap();

        let mut seen = alloc::collections::BTreeSet::new();
        let mut chunk_ids = alloc::collections::BTreeSet::new();
        for d in &descs {
            assert!(!d.id_page.is_none());
            assert!(seen.insert(d.id_page.raw()));
            chunk_ids.insert(d.id_page.decompose().0);
        }
        assert_eq!(chunk_ids.len(), 1, "all 64 pages must land in the same chunk");
        assert_eq!(gmm.inner.lock().allocated_pages, 64);
        assert_eq!(gmm.inner.lock().vm_records.get(&vm).unwrap().allocated.base, 64);
    }

    /// S2 (affinity): a second VM's handy-page request lands in a
    /// different chunk than the first VM's.
    #[test]
    fn s2_a_second_vm_gets_pages_from_a_different_chunk() {
        let gmm = gmm_for_test(1_024);
        let v1 = VmHandle::new(1);
        let v2 = VmHandle::new(2);
        let o1 = ThreadId::new(1);
        let o2 = ThreadId::new(2);

        for (vm, owner) in [(v1, o1), (v2, o2)] {
            gmm.init_per_vm(vm, owner).unwrap();
            gmm.initial_reservation(vm, owner, ReservationTriple::new(256, 64, 16), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();
        }

        let mut d1 = [GmmPageDesc::empty(); 64];
        gmm.allocate_handy_pages(v1, o1, 0, &mut d1).unwrap();
        let mut d2 = [GmmPageDesc::empty(); 64];
        gmm.allocate_handy_pages(v2, o2, 0, &mut d2).unwrap();

        let chunk1 = d1[0].id_page.decompose().0;
        let chunk2 = d2[0].id_page.decompose().0;
        assert_ne!(chunk1, chunk2);
    }

    /// S3 (account limit) through the handy-page path: a second request
    /// past the base reservation is refused and changes nothing.
    #[test]
    fn s3_handy_pages_respects_the_account_limit() {
        let gmm = gmm_for_test(1_024);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(256, 64, 16), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let mut first = [GmmPageDesc::empty(); 64];
        gmm.allocate_handy_pages(vm, owner, 0, &mut first).unwrap();

        let mut second = [GmmPageDesc::empty(); 256];
        let err = gmm.allocate_handy_pages(vm, owner, 0, &mut second).unwrap_err();
        assert_eq!(err, GmmError::HitVmAccountLimit);
        assert_eq!(gmm.inner.lock().allocated_pages, 64);
    }

    /// S4 (global limit): once `max_pages` is exhausted, any further
    /// allocation (through either entry point) reports the global limit.
    #[test]
    fn s4_handy_pages_respects_the_global_limit() {
        let gmm = gmm_for_test(64);
        let vm = VmHandle::new(1);
        let owner = ThreadId::new(1);
        gmm.init_per_vm(vm, owner).unwrap();
        gmm.initial_reservation(vm, owner, ReservationTriple::new(10_000, 0, 0), OverCommitPolicy::NoOverCommit, OomPriority::Normal).unwrap();

        let mut first = [GmmPageDesc::empty(); 64];
        gmm.allocate_handy_pages(vm, owner, 0, &mut first).unwrap();

        let mut second = [GmmPageDesc::empty(); 1];
        let err = gmm.allocate_handy_pages(vm, owner, 0, &mut second).unwrap_err();
        assert_eq!(err, GmmError::HitGlobalLimit);
    }

    #[test]
    fn term_refuses_while_a_vm_is_still_registered() {
        let gmm = gmm_for_test(1_000_000);
        let vm = VmHandle::new(1);
        gmm.init_per_vm(vm, ThreadId::new(1)).unwrap();
        assert_eq!(gmm.term().unwrap_err(), GmmError::WrongOrder);
        gmm.cleanup_vm(vm, ThreadId::new(1)).unwrap();
        assert!(gmm.term().is_ok());
    }
}
