//! Batch operations run by executors.

pub mod read;
pub mod write;

pub use read::{KeyValueRead, ReadMode};
pub use write::{KeyValueWrite, WriteOutcome, WriteStatus};
