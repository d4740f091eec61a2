use std::io;

use thiserror::Error;

/// Everything `allocate()` can hand back to its caller instead of a pointer.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Every slot of the allocation table holds a live record
    #[error("allocation table full ({capacity} live allocations)")]
    RegistryFull { capacity: usize },

    /// A live record already claims this base address
    #[error("base address {0:#x} is already registered")]
    DuplicateBase(usize),

    /// The user page must start past the base of its block
    #[error("user page {user:#x} does not follow base {base:#x}")]
    BadLayout { base: usize, user: usize },

    /// The user region is a single page
    #[error("{size} bytes do not fit in one {page_size}-byte page")]
    SizeTooLarge { size: usize, page_size: usize },

    #[error("could not map guarded region: {0}")]
    Mapping(#[source] io::Error),

    #[error("could not protect guard page: {0}")]
    Protection(#[source] io::Error),
}

pub type Result<T, E = GuardError> = std::result::Result<T, E>;
