//! The allocation table.
//!
//! Every guarded allocation is one record in a fixed array. The fault handler
//! reads this table from signal context, so it never grows, never allocates
//! and is searched with plain linear scans. Allocation, release and the
//! (rare) fault are the only callers, so the scans are cheap enough.
//!
//! Each record owns a 3-page reservation:
//!
//! ```plaintext
//! base             base + ps          base + 2ps         base + 3ps
//! +------------------+------------------+------------------+
//! | left guard       | user page        | right guard      |
//! | PROT_NONE        | read/write       | PROT_NONE        |
//! +------------------+------------------+------------------+
//! ```

use log::{debug, warn};
use serde::Serialize;

use crate::{
    alloc::provenance::StackTrace,
    error::{GuardError, Result},
    serialize::serde_usize,
};

/// Most allocations tracked at once by the process-wide instrument.
pub const MAX_ALLOCATIONS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardSide {
    Left,
    Right,
}

/// One guarded block. Only `base` and `page_size` are stored, the user
/// address and both guard boundaries are derived from them.
#[derive(Clone, Copy, Debug)]
pub struct AllocationRecord {
    base: usize,
    page_size: usize,
    requested_size: usize,
    in_use: bool,
    backtrace: StackTrace,
}

impl AllocationRecord {
    const EMPTY: AllocationRecord = AllocationRecord {
        base: 0,
        page_size: 0,
        requested_size: 0,
        in_use: false,
        backtrace: StackTrace::EMPTY,
    };

    pub fn base_address(&self) -> usize {
        self.base
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn user_address(&self) -> usize {
        self.base + self.page_size
    }

    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    /// One past the last byte the caller asked for
    pub fn user_end(&self) -> usize {
        self.user_address() + self.requested_size
    }

    pub fn left_guard_start(&self) -> usize {
        self.base
    }

    pub fn right_guard_start(&self) -> usize {
        self.base + 2 * self.page_size
    }

    /// Size of the whole reservation, guards included
    pub fn span(&self) -> usize {
        3 * self.page_size
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn backtrace(&self) -> &StackTrace {
        &self.backtrace
    }

    /// Which guard page (if any) holds `addr`. Ranges are start-inclusive,
    /// end-exclusive.
    pub fn guard_containing(&self, addr: usize) -> Option<GuardSide> {
        let left = self.left_guard_start();
        let right = self.right_guard_start();
        if (left..left + self.page_size).contains(&addr) {
            Some(GuardSide::Left)
        } else if (right..right + self.page_size).contains(&addr) {
            Some(GuardSide::Right)
        } else {
            None
        }
    }
}

/// A serializable view of one live record, for dumps and tests
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllocationInfo {
    pub slot: usize,
    #[serde(with = "serde_usize")]
    pub base: usize,
    #[serde(with = "serde_usize")]
    pub user: usize,
    pub requested_size: usize,
    #[serde(with = "serde_usize")]
    pub left_guard: usize,
    #[serde(with = "serde_usize")]
    pub right_guard: usize,
    #[serde(serialize_with = "serde_usize::serialize_all")]
    pub backtrace: Vec<usize>,
}

/// A fixed-capacity table of guarded allocations.
pub struct Registry<const N: usize> {
    slots: [AllocationRecord; N],
    live: usize,
}

impl<const N: usize> Registry<N> {
    pub const fn new() -> Self {
        Self {
            slots: [AllocationRecord::EMPTY; N],
            live: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Claim the first free slot for the block at `base` whose user page
    /// starts at `user`. The page size is `user - base`.
    pub fn insert(&mut self, base: usize, user: usize, size: usize) -> Result<usize> {
        if user <= base {
            return Err(GuardError::BadLayout { base, user });
        }
        if self.iter_live().any(|(_, rec)| rec.base == base) {
            return Err(GuardError::DuplicateBase(base));
        }
        let Some(slot) = self.slots.iter().position(|rec| !rec.in_use) else {
            warn!("allocation table full ({N} live allocations)");
            return Err(GuardError::RegistryFull { capacity: N });
        };
        self.slots[slot] = AllocationRecord {
            base,
            page_size: user - base,
            requested_size: size,
            in_use: true,
            backtrace: StackTrace::EMPTY,
        };
        self.live += 1;
        debug!("registered slot {slot}: base={base:#x}, user={user:#x}, size={size}");
        Ok(slot)
    }

    /// Attach an allocation-time stack to a slot returned by `insert()`
    pub fn set_backtrace(&mut self, slot: usize, backtrace: StackTrace) {
        if let Some(rec) = self.slots.get_mut(slot).filter(|rec| rec.in_use) {
            rec.backtrace = backtrace;
        }
    }

    /// The live record whose left or right guard page contains `addr`.
    ///
    /// This runs inside the fault handler: no logging, no allocation.
    pub fn find_by_fault_address(&self, addr: usize) -> Option<(&AllocationRecord, GuardSide)> {
        self.slots
            .iter()
            .filter(|rec| rec.in_use)
            .find_map(|rec| rec.guard_containing(addr).map(|side| (rec, side)))
    }

    pub fn find_by_user_address(&self, user: usize) -> Option<&AllocationRecord> {
        self.slots
            .iter()
            .find(|rec| rec.in_use && rec.user_address() == user)
    }

    /// Mark the record for `user` free. The slot keeps its contents until a
    /// later `insert()` overwrites it.
    pub fn remove(&mut self, user: usize) -> Option<AllocationRecord> {
        let Some(rec) = self
            .slots
            .iter_mut()
            .find(|rec| rec.in_use && rec.user_address() == user)
        else {
            warn!("tried to remove untracked allocation {user:#x}");
            return None;
        };
        rec.in_use = false;
        self.live -= 1;
        debug!("removed allocation user={user:#x}");
        Some(*rec)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &AllocationRecord)> {
        self.slots.iter().enumerate().filter(|(_, rec)| rec.in_use)
    }

    pub fn snapshot(&self) -> Vec<AllocationInfo> {
        self.iter_live()
            .map(|(slot, rec)| AllocationInfo {
                slot,
                base: rec.base_address(),
                user: rec.user_address(),
                requested_size: rec.requested_size(),
                left_guard: rec.left_guard_start(),
                right_guard: rec.right_guard_start(),
                backtrace: rec.backtrace().frames().to_vec(),
            })
            .collect()
    }
}

impl<const N: usize> Default for Registry<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: usize = 0x1000;

    /// Fake, non-overlapping 3-page blocks. Nothing is mapped, the registry
    /// only does address arithmetic.
    fn block(i: usize) -> (usize, usize) {
        let base = 0x10_0000 + i * 4 * PS;
        (base, base + PS)
    }

    #[test]
    fn insert_derives_guard_boundaries() {
        let mut reg = Registry::<4>::new();
        let (base, user) = block(0);
        let slot = reg.insert(base, user, 100).unwrap();
        let rec = reg.find_by_user_address(user).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(rec.left_guard_start(), base);
        assert_eq!(rec.user_address(), base + PS);
        assert_eq!(rec.right_guard_start(), base + 2 * PS);
        assert_eq!(rec.user_end(), user + 100);
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn full_exactly_at_capacity() {
        let mut reg = Registry::<3>::new();
        for i in 0..3 {
            let (base, user) = block(i);
            assert!(reg.insert(base, user, 8).is_ok(), "slot {i} should fit");
        }
        let (base, user) = block(3);
        assert!(matches!(
            reg.insert(base, user, 8),
            Err(GuardError::RegistryFull { capacity: 3 })
        ));
        assert_eq!(reg.live_count(), 3);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut reg = Registry::<2>::new();
        let (b0, u0) = block(0);
        let (b1, u1) = block(1);
        let (b2, u2) = block(2);
        reg.insert(b0, u0, 1).unwrap();
        reg.insert(b1, u1, 1).unwrap();
        reg.remove(u0).unwrap();
        assert_eq!(reg.insert(b2, u2, 1).unwrap(), 0);
        assert!(reg.find_by_user_address(u0).is_none());
        assert!(reg.find_by_user_address(u2).is_some());
    }

    #[test]
    fn user_page_must_follow_the_base() {
        let mut reg = Registry::<2>::new();
        let (base, _) = block(0);
        assert!(matches!(
            reg.insert(base, base, 8),
            Err(GuardError::BadLayout { base: b, user: u }) if b == base && u == base
        ));
        assert!(matches!(
            reg.insert(base, base - PS, 8),
            Err(GuardError::BadLayout { .. })
        ));
        assert_eq!(reg.live_count(), 0);
        assert!(reg.find_by_fault_address(base).is_none());
    }

    #[test]
    fn duplicate_live_base_is_rejected() {
        let mut reg = Registry::<4>::new();
        let (base, user) = block(0);
        reg.insert(base, user, 1).unwrap();
        assert!(matches!(
            reg.insert(base, user, 1),
            Err(GuardError::DuplicateBase(b)) if b == base
        ));
    }

    #[test]
    fn fault_lookup_covers_both_guards_with_inclusive_start() {
        let mut reg = Registry::<4>::new();
        let (base, user) = block(1);
        reg.insert(base, user, 10).unwrap();

        let hit = |addr| reg.find_by_fault_address(addr).map(|(_, side)| side);
        assert_eq!(hit(base), Some(GuardSide::Left));
        assert_eq!(hit(user - 1), Some(GuardSide::Left));
        assert_eq!(hit(user), None);
        assert_eq!(hit(user + PS - 1), None);
        assert_eq!(hit(user + PS), Some(GuardSide::Right));
        assert_eq!(hit(base + 3 * PS - 1), Some(GuardSide::Right));
        assert_eq!(hit(base + 3 * PS), None);
        assert_eq!(hit(base - 1), None);
    }

    #[test]
    fn removed_records_are_invisible_to_fault_lookup() {
        let mut reg = Registry::<4>::new();
        let (base, user) = block(0);
        reg.insert(base, user, 10).unwrap();
        reg.remove(user).unwrap();
        assert!(reg.find_by_fault_address(base).is_none());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn removing_untracked_address_is_a_no_op() {
        let mut reg = Registry::<4>::new();
        let (base, user) = block(0);
        reg.insert(base, user, 10).unwrap();
        assert!(reg.remove(user + 1).is_none());
        assert!(reg.remove(user).is_some());
        assert!(reg.remove(user).is_none());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn snapshot_lists_live_records_only() {
        let mut reg = Registry::<4>::new();
        let (b0, u0) = block(0);
        let (b1, u1) = block(1);
        reg.insert(b0, u0, 16).unwrap();
        reg.insert(b1, u1, 32).unwrap();
        reg.remove(u0);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].slot, 1);
        assert_eq!(snap[0].user, u1);
        assert_eq!(snap[0].requested_size, 32);
        assert_eq!(snap[0].right_guard, b1 + 2 * PS);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json[0]["user"], format!("{u1:#x}"));
    }

    #[test]
    fn backtrace_only_attaches_to_live_slot() {
        let mut reg = Registry::<2>::new();
        let (base, user) = block(0);
        let slot = reg.insert(base, user, 1).unwrap();
        let trace = StackTrace::capture(0);
        reg.set_backtrace(slot, trace);
        assert_eq!(reg.find_by_user_address(user).unwrap().backtrace(), &trace);
        reg.set_backtrace(1, trace);
        assert!(reg.slots[1].backtrace().is_empty());
    }
}
