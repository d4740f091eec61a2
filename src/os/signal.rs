//! Thin `sigaction()` plumbing for the fault signals.

use std::{io, mem, ptr};

use libc::{c_int, c_void, sigaction, sigemptyset, siginfo_t, SA_RESTART, SA_SIGINFO, SIGBUS, SIGSEGV, SIG_DFL};

/// Signature of a three-argument (`SA_SIGINFO`) signal handler
pub type FaultHandler = unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// A guard page access is a SIGSEGV on Linux but a SIGBUS on some BSDs and
/// macOS, so we listen for both.
pub const FAULT_SIGNALS: [c_int; 2] = [SIGSEGV, SIGBUS];

/// Register `handler` for every signal in [`FAULT_SIGNALS`].
pub fn install(handler: FaultHandler) -> io::Result<()> {
    // SAFETY: `sa` is fully initialized (zeroed, then the mask is emptied)
    // before the kernel reads it, and `handler` has the `SA_SIGINFO` shape.
    unsafe {
        let mut sa: sigaction = mem::zeroed();
        sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = SA_SIGINFO | SA_RESTART;
        sa.sa_sigaction = handler as usize;
        for sig in FAULT_SIGNALS {
            if sigaction(sig, &sa, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// The handler currently registered for `sig`, as the raw `sa_sigaction`
/// value (`SIG_DFL` is 0).
pub fn current_disposition(sig: c_int) -> io::Result<usize> {
    // SAFETY: a null `act` only queries, `old` is written by the kernel
    unsafe {
        let mut old: sigaction = mem::zeroed();
        if sigaction(sig, ptr::null(), &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old.sa_sigaction)
    }
}

/// Put `sig` back to its default action and raise it again.
///
/// Called from inside the handler, `sig` is blocked until the handler
/// returns, so the re-raised signal lands then (or the faulting instruction
/// simply runs again and faults under the default action).
pub fn forward_to_default(sig: c_int) {
    // SAFETY: `signal()` and `raise()` are both async-signal-safe
    unsafe {
        libc::signal(sig, SIG_DFL);
        libc::raise(sig);
    }
}
