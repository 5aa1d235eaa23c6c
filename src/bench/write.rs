//! Burn-in and full-pack writers
//!
//! Both measure the bytes that actually landed by re-reading the file size
//! from disk once the writes are done.

use super::IoOptions;
use crate::cancel::CancellationToken;
use crate::io::disk::{is_disk_full, DiskIO, WriteOutcome};
use crate::models::IoStats;
use crate::pattern::PatternBuffer;
use crate::util::units::{format_bytes, format_duration, format_rate};
use crate::{DiskPakError, Result, MB};
use std::io;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Write `buffer` once to a freshly truncated file at `path`.
///
/// Stops at the next chunk boundary when `cancel` is set. The data file is
/// removed afterwards unless `options.keep_data` is set.
pub fn write_burnin(
    disk: &dyn DiskIO,
    buffer: &PatternBuffer,
    path: &Path,
    options: &IoOptions,
    cancel: &CancellationToken,
) -> Result<IoStats> {
    options.validate()?;
    info!(
        "write_burnin with buffer of {} to \"{}\"",
        format_bytes(buffer.len() as u64),
        path.display()
    );

    let mut reporter = options.reporter("write_burnin").with_total(buffer.len() as u64);
    let start = Instant::now();
    let mut file = disk.open_write(path)?;
    let mut written = 0u64;
    let mut operations = 0u64;
    let mut cancelled = false;

    for chunk in buffer.as_bytes().chunks(options.chunk_size) {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        match file.write_chunk(chunk)? {
            WriteOutcome::Written(n) => written += n as u64,
            WriteOutcome::DiskFull { written: n } => {
                return Err(DiskPakError::IoError(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "disk full after {} of {}",
                        format_bytes(written + n as u64),
                        format_bytes(buffer.len() as u64)
                    ),
                )));
            }
        }
        operations += 1;
        reporter.record(written);
    }
    file.sync_all()?;
    drop(file);

    let elapsed = start.elapsed();
    let bytes_written = disk.file_size(path)?;
    let stats = IoStats::new(bytes_written, elapsed, operations).with_cancelled(cancelled);
    log_summary(&stats);
    reporter.finish(bytes_written);

    if !options.keep_data {
        warn!("removing data file \"{}\"", path.display());
        disk.remove(path)?;
    }
    Ok(stats)
}

/// Truncate `path`, then append `buffer` until the filesystem is full.
///
/// The bulk phase repeats the whole buffer while more than its length is
/// free. The last-chunk phase then writes 1 MiB slices of the buffer while
/// more than a slice is free, stopping early when the filesystem reports it
/// is full. Running out of space is the expected way for this to finish.
pub fn write_fulpak(
    disk: &dyn DiskIO,
    buffer: &PatternBuffer,
    path: &Path,
    options: &IoOptions,
    cancel: &CancellationToken,
) -> Result<IoStats> {
    options.validate()?;
    info!(
        "write_fulpak with buffer of {} to \"{}\"",
        format_bytes(buffer.len() as u64),
        path.display()
    );

    let bytes = buffer.as_bytes();
    let size = bytes.len() as u64;

    // Previous contents are neither counted nor left ahead of the new pattern
    drop(disk.open_write(path)?);
    let free_at_start = disk.free_space(path)?;
    let mut reporter = options.reporter("write_fulpak").with_total(free_at_start);

    let start = Instant::now();
    let mut file = disk.open_append(path)?;
    let mut written = 0u64;
    let mut operations = 0u64;
    let mut cancelled = false;
    let mut disk_full = false;

    'bulk: while disk.free_space(path)? > size {
        for chunk in bytes.chunks(options.chunk_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break 'bulk;
            }
            let outcome = file.write_chunk(chunk)?;
            written += outcome.bytes() as u64;
            operations += 1;
            reporter.record(written);
            if outcome.is_disk_full() {
                disk_full = true;
                break 'bulk;
            }
        }
    }

    if !cancelled && !disk_full {
        debug!(written = %format_bytes(written), "bulk phase done, writing last chunk");
        let steps = (bytes.len() / MB as usize).max(1);
        for i in 0..steps {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let begin = i * MB as usize;
            let slice = &bytes[begin..(begin + MB as usize).min(bytes.len())];
            if disk.free_space(path)? <= slice.len() as u64 {
                break;
            }
            let outcome = file.write_chunk(slice)?;
            written += outcome.bytes() as u64;
            operations += 1;
            reporter.record(written);
            if outcome.is_disk_full() {
                disk_full = true;
                break;
            }
        }
    }

    match file.sync_all() {
        Err(e) if is_disk_full(&e) => warn!("sync reported a full disk: {}", e),
        other => other?,
    }
    drop(file);

    let elapsed = start.elapsed();
    let bytes_written = disk.file_size(path)?;
    let stats = IoStats::new(bytes_written, elapsed, operations).with_cancelled(cancelled);
    if disk_full {
        info!("disk full after {}", format_bytes(bytes_written));
    }
    log_summary(&stats);
    reporter.finish(bytes_written);

    if !options.keep_data {
        warn!("removing data file \"{}\"", path.display());
        disk.remove(path)?;
    }
    Ok(stats)
}

fn log_summary(stats: &IoStats) {
    info!(
        "written={}, elapsed={}, throughput={}{}",
        format_bytes(stats.bytes_transferred),
        format_duration(stats.elapsed),
        format_rate(stats.bytes_per_sec()),
        if stats.cancelled { " (cancelled)" } else { "" }
    );
}
