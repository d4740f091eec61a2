//! One-time setup: the fault handler must be in place before the first
//! guarded allocation exists.

use std::sync::atomic::{AtomicU8, Ordering};

use log::info;

use crate::{fault, os::mem::resolve_page_size, putln};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Nothing installed yet
    Uninit,
    /// Mid installation. Only observable from inside `ensure_initialized()`
    Initializing,
    /// Handler installed, page size cached
    Init,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Uninit,
            1 => LifecycleState::Initializing,
            _ => LifecycleState::Init,
        }
    }
}

// Plain loads and stores, no compare-exchange. A second install is
// harmless.
static STATE: AtomicU8 = AtomicU8::new(LifecycleState::Uninit as u8);

pub fn state() -> LifecycleState {
    LifecycleState::from_u8(STATE.load(Ordering::Acquire))
}

/// Install the fault handler, once. Later calls return immediately.
///
/// If the handler can't be installed the instrument can't keep any of its
/// promises, so the process exits with status 1.
pub fn ensure_initialized() {
    if state() == LifecycleState::Init {
        return;
    }
    STATE.store(LifecycleState::Initializing as u8, Ordering::Release);

    // The fault path reads the page size, make sure it never has to be the
    // first one to ask for it.
    let page_size = resolve_page_size();

    if let Err(err) = fault::install() {
        putln!("guardheap: could not install fault handler: {err}");
        std::process::exit(1);
    }

    STATE.store(LifecycleState::Init as u8, Ordering::Release);
    info!("fault handler installed (page size {page_size} bytes)");
}
