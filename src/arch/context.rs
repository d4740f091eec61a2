//! Pulling fault details out of what the kernel hands a `SA_SIGINFO`
//! handler. Everything here is best effort: the layouts are per arch and per
//! OS, and where we don't know one we say so instead of guessing.

use std::fmt;

use libc::{c_void, siginfo_t};

/// Whether the faulting instruction was loading or storing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Unknown,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Read => "READ",
            AccessKind::Write => "WRITE",
            AccessKind::Unknown => "UNKNOWN",
        })
    }
}

/// The address whose access raised the fault
pub fn fault_address(info: &siginfo_t) -> usize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: only called for SIGSEGV/SIGBUS, for which `si_addr` is the
        // active union member
        unsafe { info.si_addr() as usize }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        info.si_addr as usize
    }
}

/// The instruction pointer at the time of the fault, when we know where the
/// kernel saved it.
///
/// # Safety
/// `context` must be null or the third argument of a `SA_SIGINFO` handler.
pub unsafe fn instruction_pointer(context: *mut c_void) -> Option<usize> {
    if context.is_null() {
        return None;
    }
    saved_pc(context)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn saved_pc(context: *mut c_void) -> Option<usize> {
    let uc = &*(context as *const libc::ucontext_t);
    Some(uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize)
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn saved_pc(context: *mut c_void) -> Option<usize> {
    let uc = &*(context as *const libc::ucontext_t);
    Some(uc.uc_mcontext.pc as usize)
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
unsafe fn saved_pc(_: *mut c_void) -> Option<usize> {
    None
}

/// Guess the access kind.
///
/// On x86_64 Linux the page-fault error code is saved with the context and
/// bit 1 says "write". Everywhere else we fall back to the signal code:
/// `SEGV_ACCERR` (a permission fault, which is what a guard page produces)
/// is reported as a write, since overflowing stores are the common case.
///
/// # Safety
/// Same as [`instruction_pointer`].
#[allow(unused_variables)]
pub unsafe fn access_kind(info: &siginfo_t, context: *mut c_void) -> AccessKind {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    if !context.is_null() {
        let uc = &*(context as *const libc::ucontext_t);
        let err = uc.uc_mcontext.gregs[libc::REG_ERR as usize];
        return if err & 0x2 != 0 {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
    }

    access_kind_from_code(info.si_signo, info.si_code)
}

/// `si_code` for a permission fault, 2 on Linux and the BSDs alike
const SEGV_ACCERR: i32 = 2;

fn access_kind_from_code(signo: i32, code: i32) -> AccessKind {
    if signo == libc::SIGSEGV && code == SEGV_ACCERR {
        AccessKind::Write
    } else {
        AccessKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEGV_MAPERR: i32 = 1;

    #[test]
    fn permission_faults_read_as_writes() {
        assert_eq!(
            access_kind_from_code(libc::SIGSEGV, SEGV_ACCERR),
            AccessKind::Write
        );
        assert_eq!(
            access_kind_from_code(libc::SIGSEGV, SEGV_MAPERR),
            AccessKind::Unknown
        );
        assert_eq!(access_kind_from_code(libc::SIGBUS, 0), AccessKind::Unknown);
    }

    #[test]
    fn null_context_has_no_instruction_pointer() {
        assert_eq!(unsafe { instruction_pointer(std::ptr::null_mut()) }, None);
    }

    #[test]
    fn access_kinds_print_like_asan() {
        assert_eq!(AccessKind::Write.to_string(), "WRITE");
        assert_eq!(AccessKind::Read.to_string(), "READ");
    }
}
