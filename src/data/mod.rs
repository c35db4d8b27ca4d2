//! Persistence of per-file metadata headers.

pub mod storage;

pub use storage::{JsonHeaderWriter, MetadataSink};
