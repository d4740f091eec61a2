//! Fixed-size call stacks. Capturing one never touches the heap, which is
//! what lets the fault handler take a snapshot of its own stack.

use std::{ffi::c_void, fmt};

/// Deepest stack we keep for a single allocation or fault.
pub const MAX_BACKTRACE_FRAMES: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackTrace {
    frames: [usize; MAX_BACKTRACE_FRAMES],
    len: usize,
}

impl StackTrace {
    pub const EMPTY: StackTrace = StackTrace {
        frames: [0; MAX_BACKTRACE_FRAMES],
        len: 0,
    };

    /// Record the current stack, dropping the innermost `skip` frames.
    /// Uses the synchronized unwinder, so not for use in a signal handler.
    #[inline(never)]
    pub fn capture(skip: usize) -> StackTrace {
        let mut trace = StackTrace::EMPTY;
        let mut seen = 0;
        backtrace::trace(|frame| trace.push_frame(frame.ip(), &mut seen, skip));
        trace
    }

    /// Like [`StackTrace::capture`], but without taking the unwinder's lock.
    ///
    /// # Safety
    /// No other thread may be unwinding at the same time. The fault handler
    /// satisfies this because the instrument is single-threaded.
    #[inline(never)]
    pub unsafe fn capture_unsynchronized(skip: usize) -> StackTrace {
        let mut trace = StackTrace::EMPTY;
        let mut seen = 0;
        backtrace::trace_unsynchronized(|frame| trace.push_frame(frame.ip(), &mut seen, skip));
        trace
    }

    /// Build a trace from known addresses, keeping at most
    /// [`MAX_BACKTRACE_FRAMES`] of them
    pub fn from_frames(ips: &[usize]) -> StackTrace {
        let mut trace = StackTrace::EMPTY;
        let len = ips.len().min(MAX_BACKTRACE_FRAMES);
        trace.frames[..len].copy_from_slice(&ips[..len]);
        trace.len = len;
        trace
    }

    /// Drop every frame above the one at `ip`. Inside a signal handler this
    /// cuts the handler and the kernel trampoline off, leaving the faulting
    /// function on top. Unwinders may report the return address one past the
    /// call, so `ip + 1` matches too. Without a match the trace is unchanged.
    pub fn starting_at(&self, ip: usize) -> StackTrace {
        match self
            .frames()
            .iter()
            .position(|&frame| frame == ip || frame == ip + 1)
        {
            Some(top) => StackTrace::from_frames(&self.frames()[top..]),
            None => *self,
        }
    }

    /// Record a trace that starts at whoever called `callee`.
    ///
    /// Every frame down to and including the one running `callee` is cut
    /// off, along with the unwinder's own frames above it. `callee` is the
    /// start address of a function that is never inlined. If no frame
    /// belongs to it the whole trace is kept.
    #[inline(never)]
    pub fn capture_from_caller_of(callee: usize) -> StackTrace {
        let mut trace = StackTrace::EMPTY;
        let mut seen = 0;
        let mut cut = None;
        backtrace::trace(|frame| {
            if cut.is_none() && frame.symbol_address() as usize == callee {
                cut = Some(trace.len + 1);
            }
            trace.push_frame(frame.ip(), &mut seen, 0)
        });
        match cut {
            Some(top) if top < trace.len => StackTrace::from_frames(&trace.frames()[top..]),
            _ => trace,
        }
    }

    fn push_frame(&mut self, ip: *mut c_void, seen: &mut usize, skip: usize) -> bool {
        // The outermost frame some unwinders hand back has no address
        if ip.is_null() {
            return false;
        }
        *seen += 1;
        if *seen <= skip {
            return true;
        }
        self.frames[self.len] = ip as usize;
        self.len += 1;
        self.len < MAX_BACKTRACE_FRAMES
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        StackTrace::EMPTY
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| *ip as *const ()))
            .finish()
    }
}

/// `#N 0x...` lines, in the same shape the fault report uses.
impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ip) in self.frames().iter().enumerate() {
            writeln!(f, "    #{i} {ip:#x}")?;
        }
        Ok(())
    }
}
