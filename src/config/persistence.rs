//! Results persistence module
//!
//! Handles saving, loading, and rotation of run records.

use crate::models::RunRecord;
use crate::{DiskPakError, Result, APP_NAME, MAX_RESULTS_HISTORY, RESULTS_FILE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Results storage manager
#[derive(Debug)]
pub struct ResultsStorage {
    results_path: PathBuf,
}

/// Results file structure for JSON persistence
#[derive(Debug, Serialize, Deserialize)]
struct ResultsFile {
    version: u32,
    results: Vec<RunRecord>,
}

impl ResultsStorage {
    pub fn new() -> Result<Self> {
        Ok(Self::with_path(Self::results_file_path()?))
    }

    /// Storage backed by an explicit file
    pub fn with_path(results_path: impl Into<PathBuf>) -> Self {
        Self {
            results_path: results_path.into(),
        }
    }

    /// Get the standard results file path
    /// Uses $DATA_HOME/diskpak/results.json
    pub fn results_file_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or_else(|| {
            DiskPakError::PersistenceError("Unable to determine data directory".to_string())
        })?;

        Ok(data_dir.join(APP_NAME).join(RESULTS_FILE))
    }

    /// Load all records from the results file
    pub fn load_results(&self) -> Result<Vec<RunRecord>> {
        if !self.results_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.results_path).map_err(|e| {
            DiskPakError::PersistenceError(format!(
                "Failed to read results file {}: {}",
                self.results_path.display(),
                e
            ))
        })?;

        let results_file: ResultsFile = serde_json::from_str(&content).map_err(|e| {
            DiskPakError::PersistenceError(format!(
                "Failed to parse results file {}: {}",
                self.results_path.display(),
                e
            ))
        })?;

        Ok(results_file.results)
    }

    /// Append a record, keeping only the newest MAX_RESULTS_HISTORY entries
    pub fn append_result(&self, record: RunRecord) -> Result<()> {
        let mut results = self.load_results()?;
        results.push(record);

        if results.len() > MAX_RESULTS_HISTORY {
            let skip_count = results.len() - MAX_RESULTS_HISTORY;
            results.drain(..skip_count);
        }

        self.save_results(results)
    }

    fn save_results(&self, results: Vec<RunRecord>) -> Result<()> {
        if let Some(parent) = self.results_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DiskPakError::PersistenceError(format!(
                    "Failed to create results directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let results_file = ResultsFile {
            version: 1,
            results,
        };
        let content = serde_json::to_string_pretty(&results_file)?;

        fs::write(&self.results_path, content).map_err(|e| {
            DiskPakError::PersistenceError(format!(
                "Failed to write results file {}: {}",
                self.results_path.display(),
                e
            ))
        })?;

        Ok(())
    }

    pub fn count_results(&self) -> Result<usize> {
        Ok(self.load_results()?.len())
    }

    pub fn clear_results(&self) -> Result<()> {
        if self.results_path.exists() {
            fs::remove_file(&self.results_path).map_err(|e| {
                DiskPakError::PersistenceError(format!(
                    "Failed to remove results file {}: {}",
                    self.results_path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// The most recent `count` records, oldest first
    pub fn get_recent_results(&self, count: usize) -> Result<Vec<RunRecord>> {
        let mut results = self.load_results()?;
        if results.len() > count {
            let skip_count = results.len() - count;
            results.drain(..skip_count);
        }
        Ok(results)
    }

    pub fn path(&self) -> &Path {
        &self.results_path
    }
}
