//! Per-VM accounting (§3, §4.G): the reservation and allocation triples,
//! private/shared page counts, and the policy/priority/availability tags.

use gmm_host::ThreadId;

use crate::policy::{Account, OomPriority, OverCommitPolicy};

/// A base/shadow/fixed triple of page counts, used for both a VM's
/// reservation and its current allocation against that reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationTriple {
    pub base: u32,
    pub shadow: u32,
    pub fixed: u32,
}

impl ReservationTriple {
    pub fn new(base: u32, shadow: u32, fixed: u32) -> Self {
        ReservationTriple { base, shadow, fixed }
    }

    pub fn sum(&self) -> u64 {
        self.base as u64 + self.shadow as u64 + self.fixed as u64
    }

    pub fn is_zero(&self) -> bool {
        self.base == 0 && self.shadow == 0 && self.fixed == 0
    }

    pub fn get(&self, account: Account) -> u32 {
        match account {
            Account::Base => self.base,
            Account::Shadow => self.shadow,
            Account::Fixed => self.fixed,
        }
    }

    pub fn get_mut(&mut self, account: Account) -> &mut u32 {
        match account {
            Account::Base => &mut self.base,
            Account::Shadow => &mut self.shadow,
            Account::Fixed => &mut self.fixed,
        }
    }

    /// Adds `pages` to exactly the requested account's counter.
    ///
    /// §9 flags that the reference source's switch statement here falls
    /// through every case without a `break`, crediting one allocation to
    /// *every* account. This is the fix: each account is credited
    /// exclusively.
    pub fn credit(&mut self, account: Account, pages: u32) {
        *self.get_mut(account) += pages;
    }
}

/// The bookkeeping the GMM keeps for one registered VM.
pub struct VmRecord {
    pub reservation: ReservationTriple,
    pub allocated: ReservationTriple,
    pub private_count: u32,
    pub shared_count: u32,
    pub policy: OverCommitPolicy,
    pub priority: OomPriority,
    /// Starts `false`; set once [`crate::Gmm::initial_reservation`]
    /// succeeds.
    pub may_allocate: bool,
    /// The thread the VM lifecycle manager designated as this VM's
    /// owner at [`crate::Gmm::init_per_vm`] time. Per-VM entry points
    /// check the caller's [`ThreadId`] against this (§5).
    pub owner_thread: Option<ThreadId>,
}

impl VmRecord {
    pub fn new() -> Self {
        VmRecord {
            reservation: ReservationTriple::default(),
            allocated: ReservationTriple::default(),
            private_count: 0,
            shared_count: 0,
            policy: OverCommitPolicy::Invalid,
            priority: OomPriority::Invalid,
            may_allocate: false,
            owner_thread: None,
        }
    }
}

impl Default for VmRecord {
    fn default() -> Self {
        Self::new()
    }
}
