//! Run result data models
//!
//! Per-operation I/O statistics, per-step reports and the persisted record
//! of a whole run.

use crate::util::units::{calculate_throughput_mbps, format_bytes, format_duration, format_throughput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::path::PathBuf;
use std::time::Duration;

/// Bytes moved by one write or read operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    /// Bytes written or verified; for writers this is the on-disk file size
    pub bytes_transferred: u64,
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
    /// Chunk-level operations performed
    pub operations: u64,
    /// The operation stopped early on a cancellation request
    pub cancelled: bool,
}

impl IoStats {
    pub fn new(bytes_transferred: u64, elapsed: Duration, operations: u64) -> Self {
        Self {
            bytes_transferred,
            elapsed,
            operations,
            cancelled: false,
        }
    }

    pub fn with_cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// MiB/s, 0 when no time elapsed
    pub fn throughput_mbps(&self) -> f64 {
        calculate_throughput_mbps(self.bytes_transferred, self.elapsed)
    }

    /// Bytes per second, 0 when no time elapsed
    pub fn bytes_per_sec(&self) -> f64 {
        if self.elapsed.is_zero() {
            0.0
        } else {
            self.bytes_transferred as f64 / self.elapsed.as_secs_f64()
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} in {} ({}){}",
            format_bytes(self.bytes_transferred),
            format_duration(self.elapsed),
            format_throughput(self.throughput_mbps()),
            if self.cancelled { " [cancelled]" } else { "" }
        )
    }
}

impl Add for IoStats {
    type Output = IoStats;

    fn add(self, rhs: IoStats) -> IoStats {
        IoStats {
            bytes_transferred: self.bytes_transferred + rhs.bytes_transferred,
            elapsed: self.elapsed + rhs.elapsed,
            operations: self.operations + rhs.operations,
            cancelled: self.cancelled || rhs.cancelled,
        }
    }
}

impl AddAssign for IoStats {
    fn add_assign(&mut self, rhs: IoStats) {
        *self = *self + rhs;
    }
}

/// Outcome of one flow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name as written in configuration, e.g. "write_burnin"
    pub step: String,
    /// I/O numbers for write and read steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<IoStats>,
    /// Free-form outcome for steps without I/O numbers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StepReport {
    pub fn io(step: impl Into<String>, stats: IoStats) -> Self {
        Self {
            step: step.into(),
            stats: Some(stats),
            note: None,
        }
    }

    pub fn note(step: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            stats: None,
            note: Some(note.into()),
        }
    }

    pub fn summary(&self) -> String {
        match (&self.stats, &self.note) {
            (Some(stats), _) => format!("{}: {}", self.step, stats.summary()),
            (None, Some(note)) => format!("{}: {}", self.step, note),
            (None, None) => self.step.clone(),
        }
    }
}

/// Persisted record of one CLI invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    /// Subcommand that produced the record
    pub command: String,
    pub data_path: PathBuf,
    /// Buffer size used, when one was generated or probed
    #[serde(default)]
    pub buffer_size: Option<u64>,
    /// Completed loop iterations
    pub iterations: u64,
    pub reports: Vec<StepReport>,
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl RunRecord {
    pub fn new(command: impl Into<String>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            timestamp: Utc::now(),
            command: command.into(),
            data_path: data_path.into(),
            buffer_size: None,
            iterations: 0,
            reports: Vec::new(),
            elapsed: Duration::ZERO,
            cancelled: false,
        }
    }

    /// Total I/O across every step report
    pub fn total_io(&self) -> IoStats {
        self.reports
            .iter()
            .filter_map(|r| r.stats)
            .fold(IoStats::default(), |acc, s| acc + s)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} - {} iteration(s) - {} steps - {}{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.command,
            self.iterations,
            self.reports.len(),
            format_duration(self.elapsed),
            if self.cancelled { " - cancelled" } else { "" }
        )
    }
}

// Durations are stored as integer nanoseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_nanos().min(u64::MAX as u128) as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
