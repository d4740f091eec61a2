//! A heap instrument that puts an inaccessible page on each side of every
//! allocation and turns a step into one of those pages into a report
//! instead of silent corruption.
//!
//! ```no_run
//! let p = guardheap::allocate(50).unwrap().as_ptr();
//! unsafe { p.sub(1).write(b'X') }; // reported, exits with status 1
//! ```
//!
//! Single-threaded and page-granular, see [`Guardian`].

pub mod alloc;
pub mod arch;
pub mod error;
pub mod externc;
pub mod fault;
pub mod lifecycle;
pub mod os;
pub mod serialize;
pub mod util;

use std::ptr::NonNull;

pub use crate::alloc::{
    guarded::{Guardian, ReleaseOutcome},
    registry::MAX_ALLOCATIONS,
};
pub use error::{GuardError, Result};
pub use os::mem::resolve_page_size;

/// The guardian behind the free functions, and the only one the fault
/// handler knows about
pub type GlobalGuardian = Guardian<MAX_ALLOCATIONS>;

static GUARDIAN: GlobalGuardian = Guardian::new();

pub fn guardian() -> &'static GlobalGuardian {
    &GUARDIAN
}

/// Install the fault handler now rather than on the first allocation
pub fn initialize() {
    lifecycle::ensure_initialized();
}

/// [`Guardian::allocate`] on the process-wide guardian. Always inlined so the
/// recorded allocation stack starts in the caller.
#[inline(always)]
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
    GUARDIAN.allocate(size)
}

/// [`Guardian::release`] on the process-wide guardian
pub fn release(ptr: *mut u8) -> ReleaseOutcome {
    GUARDIAN.release(ptr)
}
