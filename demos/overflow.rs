//! Step off either end of a guarded allocation and watch the report.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example overflow -- left
//! cargo run --example overflow -- right
//! cargo run --example overflow          # well-behaved, exits 0
//! ```

use std::ptr;

fn main() {
    env_logger::init();
    guardheap::initialize();

    let buf = guardheap::allocate(50).expect("guarded allocation").as_ptr();
    unsafe { ptr::copy_nonoverlapping(b"Hello World".as_ptr(), buf, 11) };

    match std::env::args().nth(1).as_deref() {
        Some("left") => unsafe { ptr::write_volatile(buf.sub(1), b'X') },
        Some("right") => unsafe {
            ptr::write_volatile(buf.add(guardheap::resolve_page_size()), b'X')
        },
        _ => {}
    }

    guardheap::guardian().log_allocations();
    guardheap::release(buf);
    println!("no overflow");
}
