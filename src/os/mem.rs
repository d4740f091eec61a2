use std::{io, ptr};

use libc::{mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};
use log::error;
use once_cell::sync::Lazy;

use crate::error::{GuardError, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The OS page granularity. The first call asks the OS, every later call
/// reads the cached value.
pub fn resolve_page_size() -> usize {
    *PAGE_SIZE
}

/// An owned, page-aligned anonymous mapping. Dropping it unmaps the whole
/// range, so a half-built allocation cleans up after itself on every `?`.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

impl MmapRegion {
    /// `mmap()` a private read/write region of `pages` whole pages.
    pub fn map_pages(pages: usize, page_size: usize) -> Result<MmapRegion> {
        debug_assert!(pages > 0);
        let size = pages * page_size;
        // SAFETY: anonymous mapping with no fixed address, nothing of ours is
        // aliased by the result.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            let err = io::Error::last_os_error();
            error!("mmap() of {size} bytes failed: {err}");
            return Err(GuardError::Mapping(err));
        }
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Rebuild the owner of a region previously given away with
    /// [`MmapRegion::into_raw`].
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one live mapping created by
    /// [`MmapRegion::map_pages`], and nobody else may own it.
    pub unsafe fn from_raw(ptr: *mut u8, size: usize) -> MmapRegion {
        MmapRegion { ptr, size }
    }

    /// Remove all access to `len` bytes starting at `offset` into the region.
    pub fn protect_none(&mut self, offset: usize, len: usize) -> Result<()> {
        debug_assert!(offset + len <= self.size);
        // SAFETY: the range lies inside our own mapping and `offset` is a
        // multiple of the page size at every call site.
        let rc = unsafe { mprotect(self.ptr.add(offset) as _, len, PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            error!("mprotect({:#x}, {len}, PROT_NONE) failed: {err}", self.addr() + offset);
            return Err(GuardError::Protection(err));
        }
        Ok(())
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Give up ownership without unmapping. Returns the base pointer.
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `self.ptr` is page-aligned, it came straight out of `mmap()`
        // - we own every page of `[ptr, ptr + size)` and nothing else refers
        //   to it once the owner is gone
        let rc = unsafe { munmap(self.ptr as _, self.size) };
        if rc != 0 {
            error!(
                "munmap({:#x}, {}) failed: {}",
                self.addr(),
                self.size,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_cached_power_of_two() {
        let first = resolve_page_size();
        assert!(first.is_power_of_two());
        assert_eq!(first, resolve_page_size());
    }

    #[test]
    fn mapped_region_is_page_aligned_and_writable() {
        let ps = resolve_page_size();
        let region = MmapRegion::map_pages(3, ps).unwrap();
        assert_eq!(region.addr() % ps, 0);
        assert_eq!(region.len(), 3 * ps);
        let p = region.addr() as *mut u8;
        unsafe {
            p.write(7);
            p.add(3 * ps - 1).write(9);
            assert_eq!(p.read(), 7);
        }
    }

    #[test]
    fn middle_page_stays_writable_after_guarding_outer_pages() {
        let ps = resolve_page_size();
        let mut region = MmapRegion::map_pages(3, ps).unwrap();
        region.protect_none(0, ps).unwrap();
        region.protect_none(2 * ps, ps).unwrap();
        let user = (region.addr() + ps) as *mut u8;
        unsafe {
            user.write_bytes(0xab, ps);
            assert_eq!(user.add(ps - 1).read(), 0xab);
        }
    }

    #[test]
    fn into_raw_then_from_raw_round_trips_ownership() {
        let ps = resolve_page_size();
        let region = MmapRegion::map_pages(1, ps).unwrap();
        let len = region.len();
        let ptr = region.into_raw();
        let region = unsafe { MmapRegion::from_raw(ptr, len) };
        assert_eq!(region.addr(), ptr as usize);
    }
}
