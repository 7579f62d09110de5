//! Policy/priority enumerations and the reservation account selector
//! (§3, §6). `Invalid` and `End` bound the valid range the way the
//! original request wrappers validate enum fields; real callers never
//! construct them deliberately.

/// Which of a VM's three reservation accounts an allocation draws
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Account {
    /// Guest RAM and ROM.
    Base,
    /// Guest page tables (shadow paging).
    Shadow,
    /// Hypervisor heap and MMIO2, i.e. memory the guest never sees as
    /// ordinary RAM.
    Fixed,
}

impl Account {
    pub(crate) fn index(self) -> usize {
        match self {
            Account::Base => 0,
            Account::Shadow => 1,
            Account::Fixed => 2,
        }
    }
}

/// A VM's over-commit policy tag. Enforcement beyond the reservation
/// arithmetic in [`crate::vm_record::ReservationTriple`] is a declared
/// non-goal (§1); the tag is stored and returned but does not currently
/// change allocator behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverCommitPolicy {
    /// Out-of-range sentinel; never a real VM's policy.
    Invalid,
    /// No over-commitment: the VM's reservation is hard memory.
    #[default]
    NoOverCommit,
    /// The VM may be over-committed in exchange for reclaiming memory
    /// from other over-committed VMs under pressure.
    Balanced,
    /// The VM aggressively yields memory under pressure before others.
    Aggressive,
    /// Out-of-range sentinel; never a real VM's policy.
    End,
}

impl OverCommitPolicy {
    pub fn is_valid(self) -> bool {
        !matches!(self, OverCommitPolicy::Invalid | OverCommitPolicy::End)
    }
}

/// A VM's out-of-memory priority: which VMs the host picks first when it
/// must reclaim memory under global pressure. Like [`OverCommitPolicy`],
/// stored per §3 but not yet acted on by the allocator (over-commit
/// policy enforcement beyond reservation arithmetic is deferred, §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OomPriority {
    Invalid,
    Low,
    #[default]
    Normal,
    High,
    End,
}

impl OomPriority {
    pub fn is_valid(self) -> bool {
        !matches!(self, OomPriority::Invalid | OomPriority::End)
    }
}
