//! Progress reporting for long writes and reads
//!
//! Logs a line every `log_every` bytes and optionally streams updates over
//! a channel for a progress bar. Sending never blocks the I/O loop.

use crate::util::units::{format_bytes, format_duration, format_rate};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Minimum spacing between channel updates
const UPDATE_INTERVAL: Duration = Duration::from_millis(200);

/// Progress update sent during an operation
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Operation name, e.g. "write_burnin"
    pub operation: &'static str,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Expected total, when known up front
    pub total_bytes: Option<u64>,
    /// Current throughput in bytes per second
    pub bytes_per_sec: f64,
    /// Elapsed time since start
    pub elapsed: Duration,
    /// Last update for this operation
    pub finished: bool,
}

impl ProgressUpdate {
    /// Completion fraction (0.0 to 1.0), 0 when the total is unknown
    pub fn completion_percentage(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => {
                (self.bytes_processed as f64 / total as f64).min(1.0)
            }
            _ => 0.0,
        }
    }
}

/// Cadence-driven progress logger
#[derive(Debug)]
pub struct ProgressReporter {
    operation: &'static str,
    log_every: u64,
    next_log_at: u64,
    total_bytes: Option<u64>,
    start: Instant,
    last_sent: Option<Instant>,
    tx: Option<UnboundedSender<ProgressUpdate>>,
}

impl ProgressReporter {
    /// `log_every` of 0 disables periodic log lines
    pub fn new(operation: &'static str, log_every: u64) -> Self {
        Self {
            operation,
            log_every,
            next_log_at: log_every,
            total_bytes: None,
            start: Instant::now(),
            last_sent: None,
            tx: None,
        }
    }

    pub fn with_total(mut self, total_bytes: u64) -> Self {
        self.total_bytes = Some(total_bytes);
        self
    }

    pub fn with_channel(mut self, tx: Option<UnboundedSender<ProgressUpdate>>) -> Self {
        self.tx = tx;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the running byte total; logs once per crossed cadence boundary.
    pub fn record(&mut self, bytes_processed: u64) {
        if self.log_every > 0 && bytes_processed >= self.next_log_at {
            let elapsed = self.start.elapsed();
            info!(
                "{}: {} in {} ({})",
                self.operation,
                format_bytes(bytes_processed),
                format_duration(elapsed),
                format_rate(rate(bytes_processed, elapsed))
            );
            let skipped = (bytes_processed - self.next_log_at) / self.log_every;
            self.next_log_at += (skipped + 1) * self.log_every;
        }

        let due = self
            .last_sent
            .map_or(true, |t| t.elapsed() >= UPDATE_INTERVAL);
        if due {
            self.send(bytes_processed, false);
        }
    }

    /// Send the final update for this operation
    pub fn finish(&mut self, bytes_processed: u64) {
        self.send(bytes_processed, true);
    }

    fn send(&mut self, bytes_processed: u64, finished: bool) {
        let Some(tx) = &self.tx else {
            return;
        };
        let elapsed = self.start.elapsed();
        let update = ProgressUpdate {
            operation: self.operation,
            bytes_processed,
            total_bytes: self.total_bytes,
            bytes_per_sec: rate(bytes_processed, elapsed),
            elapsed,
            finished,
        };
        // A dropped receiver only means nobody is watching
        if tx.send(update).is_err() {
            self.tx = None;
        }
        self.last_sent = Some(Instant::now());
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        0.0
    } else {
        bytes as f64 / elapsed.as_secs_f64()
    }
}
