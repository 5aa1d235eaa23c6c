//! DISKPAK - disk throughput benchmark and burn-in toolkit
//!
//! Writes byte patterns to a target disk and reads them back to measure
//! throughput and verify integrity, with cooperative cancellation and
//! repeatable multi-step flows.

use std::fmt;

pub mod bench;
pub mod cancel;
pub mod config;
pub mod flow;
pub mod io;
pub mod models;
pub mod pattern;
pub mod util;

use bench::verify::IntegrityReport;

// Common error types
#[derive(Debug)]
pub enum DiskPakError {
    /// I/O operation failed
    IoError(std::io::Error),
    /// Invalid sizes, chunking or loop bounds
    InvalidConfiguration(String),
    /// Bytes read back differ from the bytes written
    DataIntegrity(IntegrityReport),
    /// Permission denied for disk operations
    PermissionDenied(String),
    /// Operation stopped before it could produce a complete value
    Cancelled(String),
    /// Configuration file loading or parsing error
    ConfigError(String),
    /// Results persistence error
    PersistenceError(String),
    /// Partition management error
    PartitionError(String),
}

impl fmt::Display for DiskPakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskPakError::IoError(err) => write!(f, "I/O error: {}", err),
            DiskPakError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            DiskPakError::DataIntegrity(report) => write!(f, "Data integrity error: {}", report),
            DiskPakError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            DiskPakError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            DiskPakError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            DiskPakError::PersistenceError(msg) => write!(f, "Results persistence error: {}", msg),
            DiskPakError::PartitionError(msg) => write!(f, "Partition error: {}", msg),
        }
    }
}

impl std::error::Error for DiskPakError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskPakError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DiskPakError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                DiskPakError::PermissionDenied(format!("Access denied: {}", err))
            }
            _ => DiskPakError::IoError(err),
        }
    }
}

impl From<serde_json::Error> for DiskPakError {
    fn from(err: serde_json::Error) -> Self {
        DiskPakError::PersistenceError(format!("JSON serialization error: {}", err))
    }
}

impl From<toml::de::Error> for DiskPakError {
    fn from(err: toml::de::Error) -> Self {
        DiskPakError::ConfigError(format!("TOML parsing error: {}", err))
    }
}

impl From<toml::ser::Error> for DiskPakError {
    fn from(err: toml::ser::Error) -> Self {
        DiskPakError::ConfigError(format!("TOML serialization error: {}", err))
    }
}

/// Result type alias for DISKPAK operations
pub type Result<T> = std::result::Result<T, DiskPakError>;

/// Error handling utilities
pub mod error {
    use super::DiskPakError;

    /// True for errors that represent a stop request rather than a failure
    pub fn is_cancellation(error: &DiskPakError) -> bool {
        match error {
            DiskPakError::Cancelled(_) => true,
            DiskPakError::IoError(io_err) => io_err.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// Convert error to user-friendly message with suggestions
    pub fn user_friendly_message(error: &DiskPakError) -> String {
        match error {
            DiskPakError::PermissionDenied(_) => {
                "Permission denied. Try running as administrator or check file permissions."
                    .to_string()
            }
            DiskPakError::InvalidConfiguration(msg) => {
                format!("Invalid configuration: {}. Check sizes, chunk size and loop bounds.", msg)
            }
            DiskPakError::DataIntegrity(report) => format!(
                "Data read back from disk does not match what was written ({} mismatches shown). \
                 The drive or its cable may be failing.",
                report.mismatches.len()
            ),
            DiskPakError::ConfigError(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            DiskPakError::PersistenceError(_) => {
                "Failed to save results. Check disk space and permissions.".to_string()
            }
            DiskPakError::Cancelled(_) => "Operation was cancelled by user.".to_string(),
            _ => error.to_string(),
        }
    }
}

// Common types and constants
pub const APP_NAME: &str = "diskpak";
pub const CONFIG_FILE: &str = "diskpak.toml";
pub const RESULTS_FILE: &str = "results.json";
pub const DATA_FILE: &str = "data.dat";
pub const MAX_RESULTS_HISTORY: usize = 100;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// Largest data file read back whole as the expected pattern
pub const MAX_LOADED_BUFFER: u64 = 4 * GB;
