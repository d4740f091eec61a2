pub mod guarded;
pub mod provenance;
pub mod registry;
