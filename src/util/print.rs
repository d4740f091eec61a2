use std::fmt;

use libc::{c_int, STDERR_FILENO};

/// A `fmt::Write` sink that goes straight to a file descriptor with
/// `write(2)`. It never allocates and never takes a lock, so it is the one
/// output path allowed inside the fault handler.
#[derive(Clone, Copy, Debug)]
pub struct RawFd(pub c_int);

impl RawFd {
    pub const STDERR: RawFd = RawFd(STDERR_FILENO);
}

impl fmt::Write for RawFd {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            // SAFETY: `bytes` is a live, initialized slice for the whole call
            let n = unsafe { libc::write(self.0, bytes.as_ptr() as _, bytes.len()) };
            if n < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(fmt::Error);
            }
            bytes = &bytes[n as usize..];
        }
        Ok(())
    }
}

/// `println!()`, but to stderr through [`RawFd`], so it is safe to use where
/// the allocator or the stdio locks may be in a broken state.
#[macro_export]
macro_rules! putln {
    () => {
        $crate::putln!("")
    };
    ($($arg:tt)*) => {{
        use ::core::fmt::Write as _;
        let mut out = $crate::util::print::RawFd::STDERR;
        let _ = ::core::writeln!(out, $($arg)*);
    }};
}
