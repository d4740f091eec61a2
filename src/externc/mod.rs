//! C entry points, so plain C programs can link the instrument and call it
//! in place of `malloc()`/`free()`.

use libc::{c_void, size_t};
use log::error;

use crate::{allocate, guardian, initialize, release};

#[no_mangle]
pub extern "C" fn guardheap_init() {
    initialize();
}

/// Null on failure, like `malloc()`
#[no_mangle]
pub extern "C" fn guardheap_malloc(size: size_t) -> *mut c_void {
    match allocate(size) {
        Ok(ptr) => ptr.as_ptr() as _,
        Err(err) => {
            error!("guardheap_malloc({size}): {err}");
            std::ptr::null_mut()
        }
    }
}

/// Accepts null and pointers it never handed out, like a forgiving `free()`
#[no_mangle]
pub extern "C" fn guardheap_free(ptr: *mut c_void) {
    release(ptr as _);
}

#[no_mangle]
pub extern "C" fn guardheap_print_allocations() {
    guardian().log_allocations();
}
