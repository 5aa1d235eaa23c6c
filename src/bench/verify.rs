//! Integrity comparison between expected and read-back bytes

use crate::{DiskPakError, Result};
use std::fmt;

/// Differences reported per failing chunk
pub const MAX_REPORTED_DIFFS: usize = 10;

/// One differing byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Index within the compared chunk
    pub index: usize,
    pub expected: u8,
    pub actual: u8,
}

/// Why a chunk read back from disk was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    /// File offset of the first byte of the chunk
    pub offset: u64,
    pub expected_len: usize,
    pub actual_len: usize,
    /// At most [`MAX_REPORTED_DIFFS`] differing positions, in index order
    pub mismatches: Vec<Mismatch>,
}

impl IntegrityReport {
    pub fn length_mismatch(&self) -> bool {
        self.expected_len != self.actual_len
    }

    pub fn is_clean(&self) -> bool {
        !self.length_mismatch() && self.mismatches.is_empty()
    }
}

impl fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk at offset {} differs", self.offset)?;
        if self.length_mismatch() {
            write!(
                f,
                "; length does not match: {} != {}",
                self.expected_len, self.actual_len
            )?;
        }
        for m in &self.mismatches {
            write!(
                f,
                "; byte {} expected {} got {}",
                m.index, m.expected, m.actual
            )?;
        }
        Ok(())
    }
}

/// Compare two byte slices, collecting up to `max_diffs` differing positions.
///
/// Positions past the shorter slice are covered by the length note, not
/// listed individually.
pub fn diff_bytes(expected: &[u8], actual: &[u8], offset: u64, max_diffs: usize) -> IntegrityReport {
    let mismatches = expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(_, (e, a))| e != a)
        .take(max_diffs)
        .map(|(index, (&expected, &actual))| Mismatch {
            index,
            expected,
            actual,
        })
        .collect();

    IntegrityReport {
        offset,
        expected_len: expected.len(),
        actual_len: actual.len(),
        mismatches,
    }
}

/// Fail with [`DiskPakError::DataIntegrity`] unless the slices are identical
pub fn verify_chunk(expected: &[u8], actual: &[u8], offset: u64) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    Err(DiskPakError::DataIntegrity(diff_bytes(
        expected,
        actual,
        offset,
        MAX_REPORTED_DIFFS,
    )))
}
