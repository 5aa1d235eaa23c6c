//! I/O operations module
//!
//! Filesystem abstraction used by the writers and readers, so capacity
//! limits and failures can be simulated in tests.

pub mod disk;

#[cfg(test)]
pub(crate) mod memory;

pub use disk::{
    create_disk_io, is_disk_full, DirectFile, DiskIO, PlatformDiskIO, WriteOutcome,
};
