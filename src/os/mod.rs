pub mod mem;
pub mod signal;
