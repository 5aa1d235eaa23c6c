//! Write/read throughput engine
//!
//! Pattern writers and verifying readers, the throughput probe, and the
//! bounded loop that repeats them.

pub mod looping;
pub mod probe;
pub mod progress;
pub mod read;
pub mod verify;
pub mod write;

use crate::error::is_cancellation;
use crate::models::IoStats;
use crate::{DiskPakError, Result, GB, MB};
use progress::ProgressUpdate;
use tokio::sync::mpsc::UnboundedSender;

pub use looping::{LoopController, LoopSpec, ResultMode};
pub use probe::{find_best_chunk, select_sweet_spot, ProbeOutcome, ThroughputSample};
pub use progress::ProgressReporter;
pub use read::{read_rand, read_seq};
pub use write::{write_burnin, write_fulpak};

/// Settings shared by the writers and readers
#[derive(Debug, Clone)]
pub struct IoOptions {
    /// Bytes per write or read call
    pub chunk_size: usize,
    /// Log a progress line every this many bytes (0 = never)
    pub log_every: u64,
    /// Leave the data file in place after a write
    pub keep_data: bool,
    pub progress: Option<UnboundedSender<ProgressUpdate>>,
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            chunk_size: MB as usize,
            log_every: GB,
            keep_data: false,
            progress: None,
        }
    }
}

impl IoOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every;
        self
    }

    pub fn with_keep_data(mut self, keep_data: bool) -> Self {
        self.keep_data = keep_data;
        self
    }

    pub fn with_progress(mut self, tx: Option<UnboundedSender<ProgressUpdate>>) -> Self {
        self.progress = tx;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DiskPakError::InvalidConfiguration(
                "Chunk size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn reporter(&self, operation: &'static str) -> ProgressReporter {
        ProgressReporter::new(operation, self.log_every).with_channel(self.progress.clone())
    }
}

/// Lifecycle of one write or read operation
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running,
    /// Finished all requested work
    Completed,
    /// Stopped early on request; partial results are valid
    Cancelled,
    /// Stopped by an error
    Failed(String),
}

impl RunState {
    /// Terminal state for an operation outcome
    pub fn settle(outcome: &Result<IoStats>) -> Self {
        match outcome {
            Ok(stats) => Self::finished(stats.cancelled),
            Err(e) => Self::from_error(e),
        }
    }

    pub fn finished(cancelled: bool) -> Self {
        if cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        }
    }

    /// Cancellation errors still count as a clean stop
    pub fn from_error(error: &DiskPakError) -> Self {
        if is_cancellation(error) {
            RunState::Cancelled
        } else {
            RunState::Failed(error.to_string())
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed(_)
        )
    }

    /// Completed and Cancelled both leave valid results
    pub fn is_clean(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled)
    }
}
