//! Data models module
//!
//! I/O statistics, step reports and persisted run records.

pub mod result;

pub use result::{IoStats, RunRecord, StepReport};
