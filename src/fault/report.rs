//! The text of a guard-violation report. Formatting goes through
//! `core::fmt` into any `fmt::Write`, which is a raw file descriptor in the
//! handler and a `String` in tests.

use std::fmt::{self, Write};

use crate::{
    alloc::{
        provenance::StackTrace,
        registry::{AllocationRecord, GuardSide},
    },
    arch::context::AccessKind,
};

use super::FaultEvent;

const RULE: &str = "=================================================================";
const TOOL: &str = "GuardHeap";

/// Where the fault landed relative to the caller's region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relation {
    pub side: GuardSide,
    /// Bytes between the fault and the nearest edge of the requested region
    pub distance: usize,
    /// Bytes between the fault and the start of the guard page it hit
    pub guard_offset: usize,
    pub guard_start: usize,
    pub region_start: usize,
    pub region_end: usize,
    pub region_size: usize,
}

impl Relation {
    pub fn new(addr: usize, record: &AllocationRecord, side: GuardSide) -> Relation {
        let (distance, guard_start) = match side {
            GuardSide::Left => (record.user_address() - addr, record.left_guard_start()),
            GuardSide::Right => (addr - record.user_end(), record.right_guard_start()),
        };
        Relation {
            side,
            distance,
            guard_offset: addr - guard_start,
            guard_start,
            region_start: record.user_address(),
            region_end: record.user_end(),
            region_size: record.requested_size(),
        }
    }

    fn direction(&self) -> &'static str {
        match self.side {
            GuardSide::Left => "left",
            GuardSide::Right => "right",
        }
    }
}

struct Bytes(usize);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            1 => f.write_str("1 byte"),
            n => write!(f, "{n} bytes"),
        }
    }
}

/// Write the full report for a fault that hit `record`'s guard page.
pub fn write_report<W: Write>(
    out: &mut W,
    pid: i32,
    event: &FaultEvent,
    record: &AllocationRecord,
    side: GuardSide,
    crash_stack: &StackTrace,
) -> fmt::Result {
    let addr = event.address;
    writeln!(out, "{RULE}")?;
    write!(
        out,
        "=={pid}==ERROR: {TOOL}: heap-buffer-overflow on address {addr:#x}"
    )?;
    if let Some(pc) = event.pc {
        write!(out, " at pc {pc:#x}")?;
    }
    writeln!(out)?;

    match event.access {
        AccessKind::Unknown => writeln!(out, "access (kind unknown) at {addr:#x} thread T0")?,
        kind => writeln!(out, "{kind} at {addr:#x} thread T0")?,
    }
    write!(out, "{crash_stack}")?;
    writeln!(out)?;

    let rel = Relation::new(addr, record, side);
    writeln!(
        out,
        "{addr:#x} is located {} to the {} of {}-byte region [{:#x},{:#x})",
        Bytes(rel.distance),
        rel.direction(),
        rel.region_size,
        rel.region_start,
        rel.region_end,
    )?;
    writeln!(
        out,
        "{addr:#x} is at offset {} into the {} guard page [{:#x},{:#x})",
        rel.guard_offset,
        rel.direction(),
        rel.guard_start,
        rel.guard_start + record.page_size(),
    )?;
    writeln!(out)?;

    if record.backtrace().is_empty() {
        writeln!(out, "allocation stack unavailable")?;
    } else {
        writeln!(out, "allocated by thread T0 here:")?;
        write!(out, "{}", record.backtrace())?;
    }
    writeln!(out)?;

    writeln!(
        out,
        "SUMMARY: {TOOL}: heap-buffer-overflow ({} guard of {:#x})",
        rel.direction(),
        rel.region_start
    )?;
    writeln!(out, "{RULE}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::registry::Registry;

    const PS: usize = 0x1000;
    const BASE: usize = 0x7000_0000;

    fn registry_with(size: usize) -> Registry<1> {
        let mut reg = Registry::<1>::new();
        let slot = reg.insert(BASE, BASE + PS, size).unwrap();
        reg.set_backtrace(slot, StackTrace::from_frames(&[0xaaa, 0xbbb]));
        reg
    }

    fn render(reg: &Registry<1>, addr: usize, access: AccessKind) -> String {
        let (record, side) = reg.find_by_fault_address(addr).unwrap();
        let event = FaultEvent {
            signal: libc::SIGSEGV,
            from_kernel: true,
            address: addr,
            pc: Some(0x4242),
            access,
        };
        let mut out = String::new();
        write_report(
            &mut out,
            77,
            &event,
            record,
            side,
            &StackTrace::from_frames(&[0x4242, 0x5353]),
        )
        .unwrap();
        out
    }

    #[test]
    fn one_byte_left_of_region() {
        let reg = registry_with(50);
        let user = BASE + PS;
        let text = render(&reg, user - 1, AccessKind::Write);
        assert!(text.contains("==77==ERROR: GuardHeap: heap-buffer-overflow on address"));
        assert!(text.contains(&format!("WRITE at {:#x} thread T0", user - 1)));
        assert!(text.contains(&format!(
            "is located 1 byte to the left of 50-byte region [{user:#x},{:#x})",
            user + 50
        )));
        assert!(text.contains(&format!("offset {} into the left guard page", PS - 1)));
    }

    #[test]
    fn first_byte_of_right_guard() {
        let reg = registry_with(10);
        let user = BASE + PS;
        let text = render(&reg, user + PS, AccessKind::Write);
        assert!(text.contains(&format!(
            "is located {} bytes to the right of 10-byte region",
            PS - 10
        )));
        assert!(text.contains("offset 0 into the right guard page"));
        assert!(text.contains("SUMMARY: GuardHeap: heap-buffer-overflow (right guard"));
    }

    #[test]
    fn report_sections_come_in_order() {
        let reg = registry_with(8);
        let text = render(&reg, BASE, AccessKind::Read);
        let banner = text.find("ERROR").unwrap();
        let access = text.find("READ at").unwrap();
        let crash = text.find("#0 0x4242").unwrap();
        let relation = text.find("is located").unwrap();
        let alloc = text.find("allocated by thread T0 here:").unwrap();
        let alloc_frame = text.find("#1 0xbbb").unwrap();
        let summary = text.find("SUMMARY").unwrap();
        assert!(banner < access && access < crash && crash < relation);
        assert!(relation < alloc && alloc < alloc_frame && alloc_frame < summary);
        assert!(text.starts_with(RULE) && text.trim_end().ends_with(RULE));
    }

    #[test]
    fn unknown_access_kind_is_spelled_out() {
        let reg = registry_with(8);
        let text = render(&reg, BASE + 3, AccessKind::Unknown);
        assert!(text.contains("access (kind unknown)"));
    }

    #[test]
    fn relation_measures_from_region_edges() {
        let reg = registry_with(100);
        let (record, side) = reg.find_by_fault_address(BASE + 2 * PS + 5).unwrap();
        let rel = Relation::new(BASE + 2 * PS + 5, record, side);
        assert_eq!(rel.side, GuardSide::Right);
        assert_eq!(rel.distance, PS + 5 - 100);
        assert_eq!(rel.guard_offset, 5);
        assert_eq!(rel.region_end, BASE + PS + 100);
    }
}
