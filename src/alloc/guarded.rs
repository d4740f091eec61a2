//! The guarded allocator. Every allocation is three fresh pages:
//! an inaccessible page on either side of one read/write page, so a step
//! off either end of the user page faults straight away.
//!
//! Only whole pages are protected. Reads and writes past `size` but still
//! inside the middle page go unnoticed.

use std::{cell::UnsafeCell, ptr::NonNull};

use log::{info, warn};

use crate::{
    alloc::{
        provenance::StackTrace,
        registry::{AllocationInfo, Registry},
    },
    error::{GuardError, Result},
    lifecycle,
    os::mem::{resolve_page_size, MmapRegion},
};

/// Left guard, user page, right guard
const GUARDED_PAGES: usize = 3;

/// What `release()` did with the pointer it was given
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Null pointer, nothing to do
    Null,
    /// Not an address we handed out (or already released), ignored
    Untracked,
    /// Unregistered and unmapped
    Released,
}

/// A guarded allocator with room for `N` live allocations.
///
/// # Single-writer rule
///
/// `Guardian` is not thread-safe. It is `Sync` so that one instance can live
/// in a `static` and be read by the fault handler, but `allocate()` and
/// `release()` must never run concurrently with each other on the same
/// instance. Only the process-wide instance ([`crate::guardian()`]) is
/// consulted when a fault arrives; faults in the guards of any other
/// instance are forwarded to the default action.
pub struct Guardian<const N: usize> {
    registry: UnsafeCell<Registry<N>>,
}

// SAFETY: see the single-writer rule above. The fault path only reads.
unsafe impl<const N: usize> Sync for Guardian<N> {}

impl<const N: usize> Guardian<N> {
    pub const fn new() -> Self {
        Self {
            registry: UnsafeCell::new(Registry::new()),
        }
    }

    /// # Safety
    /// No `&mut` to the registry may be live. Holds for the fault handler,
    /// which interrupts but never overlaps a registry update under the
    /// single-writer rule.
    pub(crate) unsafe fn registry_unchecked(&self) -> &Registry<N> {
        &*self.registry.get()
    }

    #[allow(clippy::mut_from_ref)]
    fn registry_mut(&self) -> &mut Registry<N> {
        // SAFETY: single-writer rule; every caller drops the borrow before
        // returning and none of them re-enter.
        unsafe { &mut *self.registry.get() }
    }

    fn registry(&self) -> &Registry<N> {
        // SAFETY: as above
        unsafe { self.registry_unchecked() }
    }

    /// Map a guarded block with room for `size` bytes and return the start
    /// of its user page.
    ///
    /// Fails with [`GuardError::SizeTooLarge`] above one page, and with
    /// [`GuardError::RegistryFull`] once `N` allocations are live. A failed
    /// allocation never leaves a mapping behind.
    #[inline(never)]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        lifecycle::ensure_initialized();
        let page_size = resolve_page_size();
        if size > page_size {
            return Err(GuardError::SizeTooLarge { size, page_size });
        }

        // Dropping `region` on any early return unmaps all three pages
        let mut region = MmapRegion::map_pages(GUARDED_PAGES, page_size)?;
        region.protect_none(0, page_size)?;
        region.protect_none(2 * page_size, page_size)?;

        let base = region.addr();
        let user = base + page_size;
        let registry = self.registry_mut();
        let slot = registry.insert(base, user, size)?;
        let this: fn(&Self, usize) -> Result<NonNull<u8>> = Self::allocate;
        registry.set_backtrace(slot, StackTrace::capture_from_caller_of(this as usize));

        let base = region.into_raw();
        info!("allocated {size} bytes at {user:#x} (base {:#x})", base as usize);
        // SAFETY: `base + page_size` is inside the mapping, and the mapping is
        // never at address 0
        Ok(unsafe { NonNull::new_unchecked(base.add(page_size)) })
    }

    /// Unmap the block whose user page starts at `ptr`.
    ///
    /// Null is a no-op. An address this instance doesn't track (including
    /// one already released) only logs a warning. After release the whole
    /// block is unmapped; touching it faults like any other unmapped address
    /// and is not attributed to this allocation.
    pub fn release(&self, ptr: *mut u8) -> ReleaseOutcome {
        if ptr.is_null() {
            return ReleaseOutcome::Null;
        }
        lifecycle::ensure_initialized();

        let user = ptr as usize;
        let registry = self.registry_mut();
        let Some((base, span)) = registry
            .find_by_user_address(user)
            .map(|rec| (rec.base_address(), rec.span()))
        else {
            warn!("release of {user:#x}, which is not a tracked allocation");
            return ReleaseOutcome::Untracked;
        };
        registry.remove(user);

        // SAFETY: `base`/`span` describe the mapping made by `allocate()`,
        // whose ownership the registry held until the line above.
        drop(unsafe { MmapRegion::from_raw(base as *mut u8, span) });
        info!("released {user:#x} (base {base:#x})");
        ReleaseOutcome::Released
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn live_count(&self) -> usize {
        self.registry().live_count()
    }

    /// Is `addr` inside a guard page of a live allocation?
    pub fn owns_guard(&self, addr: usize) -> bool {
        self.registry().find_by_fault_address(addr).is_some()
    }

    /// The start of the 3-page block behind a user address
    pub fn base_of(&self, user: *const u8) -> Option<usize> {
        self.registry()
            .find_by_user_address(user as usize)
            .map(|rec| rec.base_address())
    }

    pub fn snapshot(&self) -> Vec<AllocationInfo> {
        self.registry().snapshot()
    }

    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Dump the allocation table at `info` level
    pub fn log_allocations(&self) {
        let registry = self.registry();
        info!("=== current allocations ({} live) ===", registry.live_count());
        for (slot, rec) in registry.iter_live() {
            info!(
                "slot {slot}: base={:#x}, user={:#x}, size={}, left_guard={:#x}, right_guard={:#x}",
                rec.base_address(),
                rec.user_address(),
                rec.requested_size(),
                rec.left_guard_start(),
                rec.right_guard_start(),
            );
        }
    }
}

impl<const N: usize> Default for Guardian<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for Guardian<N> {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        let live: Vec<_> = registry.iter_live().map(|(_, rec)| *rec).collect();
        for rec in live {
            registry.remove(rec.user_address());
            // SAFETY: the registry owned this mapping and nobody can reach
            // the guardian any more
            drop(unsafe { MmapRegion::from_raw(rec.base_address() as *mut u8, rec.span()) });
        }
    }
}
