//! Reading log implementation.
//!
//! Readings are stored in an append-only log with an in-memory index
//! rebuilt on open.

mod index;
mod log;

pub use index::ReadingIndex;
pub use log::{LogEntry, LogIterator, ReadingLog};
