//! Sequential and random-offset readers with integrity verification
//!
//! The data file may hold the expected buffer repeated any number of times
//! (full-pack output), so file offset `o` is compared against buffer byte
//! `o % len`.

use super::verify::{verify_chunk, IntegrityReport};
use super::IoOptions;
use crate::cancel::CancellationToken;
use crate::io::disk::DiskIO;
use crate::models::IoStats;
use crate::pattern::PatternBuffer;
use crate::util::units::{format_bytes, format_duration, format_rate};
use crate::{DiskPakError, Result};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Read `path` front to back in `options.chunk_size` pieces, verifying each.
pub fn read_seq(
    disk: &dyn DiskIO,
    expected: &PatternBuffer,
    path: &Path,
    options: &IoOptions,
    cancel: &CancellationToken,
) -> Result<IoStats> {
    options.validate()?;
    info!(
        "read_seq of \"{}\" against buffer of {}",
        path.display(),
        format_bytes(expected.len() as u64)
    );

    let file_size = disk.file_size(path)?;
    let mut reporter = options.reporter("read_seq").with_total(file_size);
    let start = Instant::now();
    let mut file = disk.open_read(path)?;
    let mut chunk = vec![0u8; options.chunk_size];
    let mut offset = 0u64;
    let mut operations = 0u64;
    let mut cancelled = false;

    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let n = file.read_chunk(&mut chunk)?;
        if n == 0 {
            break;
        }
        verify_at(expected.as_bytes(), offset, &chunk[..n])?;
        offset += n as u64;
        operations += 1;
        reporter.record(offset);
    }

    if !cancelled && offset != file_size {
        return Err(DiskPakError::DataIntegrity(IntegrityReport {
            offset: 0,
            expected_len: file_size as usize,
            actual_len: offset as usize,
            mismatches: Vec::new(),
        }));
    }

    let stats = IoStats::new(offset, start.elapsed(), operations).with_cancelled(cancelled);
    log_summary(&stats);
    reporter.finish(offset);
    Ok(stats)
}

/// Read every chunk of `path` once, in a uniformly shuffled order.
///
/// `options.chunk_size` must divide the buffer length so that no chunk
/// straddles a repetition boundary; this is checked before the file is
/// touched.
pub fn read_rand(
    disk: &dyn DiskIO,
    expected: &PatternBuffer,
    path: &Path,
    options: &IoOptions,
    cancel: &CancellationToken,
) -> Result<IoStats> {
    read_rand_with_rng(disk, expected, path, options, cancel, &mut SmallRng::from_entropy())
}

pub fn read_rand_with_rng<R: Rng>(
    disk: &dyn DiskIO,
    expected: &PatternBuffer,
    path: &Path,
    options: &IoOptions,
    cancel: &CancellationToken,
    rng: &mut R,
) -> Result<IoStats> {
    options.validate()?;
    let len = expected.len();
    let chunk_size = options.chunk_size;
    if len % chunk_size != 0 {
        return Err(DiskPakError::InvalidConfiguration(format!(
            "Chunk size {} must evenly divide the buffer length {}",
            chunk_size, len
        )));
    }
    info!(
        "read_rand of \"{}\" against buffer of {} in {} chunks",
        path.display(),
        format_bytes(len as u64),
        format_bytes(chunk_size as u64)
    );

    let file_size = disk.file_size(path)?;
    let mut offsets: Vec<u64> = (0..file_size).step_by(chunk_size).collect();
    offsets.shuffle(rng);

    let mut reporter = options.reporter("read_rand").with_total(file_size);
    let start = Instant::now();
    let mut file = disk.open_read(path)?;
    let mut chunk = vec![0u8; chunk_size];
    let bytes = expected.as_bytes();
    let mut read = 0u64;
    let mut operations = 0u64;
    let mut cancelled = false;

    for offset in offsets {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let want = chunk_size.min((file_size - offset) as usize);
        file.seek_to(SeekFrom::Start(offset))?;
        let n = file.read_chunk(&mut chunk[..want])?;
        let pos = (offset % len as u64) as usize;
        verify_chunk(&bytes[pos..pos + want], &chunk[..n], offset)?;
        read += n as u64;
        operations += 1;
        reporter.record(read);
    }

    let stats = IoStats::new(read, start.elapsed(), operations).with_cancelled(cancelled);
    log_summary(&stats);
    reporter.finish(read);
    Ok(stats)
}

/// Load an existing data file as the expected pattern.
///
/// Files over `max_len` are refused rather than read into memory; a
/// full-pack file is as large as the disk it filled.
pub fn load_data_file(disk: &dyn DiskIO, path: &Path, max_len: u64) -> Result<PatternBuffer> {
    let size = disk.file_size(path)?;
    if size > max_len {
        return Err(DiskPakError::InvalidConfiguration(format!(
            "Data file \"{}\" is {}, above the {} that can be loaded as the expected pattern; \
             set the buffer size and fill that wrote it instead",
            path.display(),
            format_bytes(size),
            format_bytes(max_len)
        )));
    }
    info!("loading buffer of {} from \"{}\"", format_bytes(size), path.display());

    let mut data = vec![0u8; size as usize];
    let mut file = disk.open_read(path)?;
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read_chunk(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    PatternBuffer::loaded(data)
}

/// Compare `actual`, read at file `offset`, with the repeating `expected`
fn verify_at(expected: &[u8], offset: u64, actual: &[u8]) -> Result<()> {
    let len = expected.len();
    let pos = (offset % len as u64) as usize;
    if pos + actual.len() <= len {
        return verify_chunk(&expected[pos..pos + actual.len()], actual, offset);
    }

    let wrapped: Vec<u8> = (0..actual.len()).map(|i| expected[(pos + i) % len]).collect();
    verify_chunk(&wrapped, actual, offset)
}

fn log_summary(stats: &IoStats) {
    info!(
        "read={}, elapsed={}, throughput={}{}",
        format_bytes(stats.bytes_transferred),
        format_duration(stats.elapsed),
        format_rate(stats.bytes_per_sec()),
        if stats.cancelled { " (cancelled)" } else { "" }
    );
}
