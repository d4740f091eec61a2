//! The fault classifier.
//!
//! Every SIGSEGV/SIGBUS goes through the same three steps:
//!
//! ```plaintext
//! Entry --> Triage --+--> Report   (guard page we own: print, _exit(1))
//!                    |
//!                    +--> Forward  (anything else: default action, re-raise)
//! ```
//!
//! This all runs in signal context, so nothing below may allocate, lock or
//! log. The registry is only read, the stacks live in fixed arrays and the
//! report is written with `write(2)`.

pub mod report;

use libc::{c_int, c_void, siginfo_t};

use crate::{
    alloc::{
        provenance::StackTrace,
        registry::{AllocationRecord, GuardSide, Registry},
    },
    arch::context::{self, AccessKind},
    guardian,
    os::signal,
    util::print::RawFd,
};

/// What the kernel told us about one offending access
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultEvent {
    pub signal: c_int,
    /// Raised by the kernel for a memory access, as opposed to sent with
    /// `kill()`/`raise()`. Only then does `address` mean anything.
    pub from_kernel: bool,
    pub address: usize,
    pub pc: Option<usize>,
    pub access: AccessKind,
}

impl FaultEvent {
    /// # Safety
    /// `info` and `context` must be the arguments of a `SA_SIGINFO` handler
    /// invocation for `signal`.
    pub unsafe fn from_raw(signal: c_int, info: &siginfo_t, context: *mut c_void) -> FaultEvent {
        FaultEvent {
            signal,
            from_kernel: info.si_code > 0,
            address: context::fault_address(info),
            pc: context::instruction_pointer(context),
            access: context::access_kind(info, context),
        }
    }
}

#[derive(Debug)]
pub enum Verdict<'r> {
    /// The access hit one of our guard pages
    Report {
        record: &'r AllocationRecord,
        side: GuardSide,
    },
    /// Not ours, let the platform deal with it
    Forward,
}

pub fn triage<'r, const N: usize>(registry: &'r Registry<N>, event: &FaultEvent) -> Verdict<'r> {
    if !event.from_kernel {
        return Verdict::Forward;
    }
    match registry.find_by_fault_address(event.address) {
        Some((record, side)) => Verdict::Report { record, side },
        None => Verdict::Forward,
    }
}

/// Write the report to stderr and terminate with status 1.
fn report_and_exit(event: &FaultEvent, record: &AllocationRecord, side: GuardSide) -> ! {
    // SAFETY: single-threaded, nobody else is unwinding
    let mut crash_stack = unsafe { StackTrace::capture_unsynchronized(0) };
    if let Some(pc) = event.pc {
        crash_stack = crash_stack.starting_at(pc);
    }
    // SAFETY: `getpid()` is async-signal-safe and cannot fail
    let pid = unsafe { libc::getpid() };
    let mut out = RawFd::STDERR;
    let _ = report::write_report(&mut out, pid, event, record, side, &crash_stack);
    // SAFETY: `_exit()` skips atexit handlers and stdio flushing, both of
    // which could deadlock or allocate from here
    unsafe { libc::_exit(1) }
}

unsafe extern "C" fn handle_fault(sig: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let Some(info) = info.as_ref() else {
        signal::forward_to_default(sig);
        return;
    };
    let event = FaultEvent::from_raw(sig, info, context);

    // SAFETY: read-only access from the fault path, the single-writer rule
    // keeps allocate()/release() from running concurrently
    let registry = guardian().registry_unchecked();
    match triage(registry, &event) {
        Verdict::Report { record, side } => report_and_exit(&event, record, side),
        Verdict::Forward => signal::forward_to_default(sig),
    }
}

/// Register the classifier for the fault signals
pub fn install() -> std::io::Result<()> {
    signal::install(handle_fault)
}

/// The raw handler address, as `sigaction()` reports it back
pub fn handler_address() -> usize {
    handle_fault as signal::FaultHandler as usize
}
