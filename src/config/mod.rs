//! Configuration management module
//!
//! Handles loading, saving, and validation of run settings: the target data
//! file, buffer shape, chunking, loop bounds and flow steps.

use crate::bench::probe::ProbeBudget;
use crate::bench::{IoOptions, LoopSpec};
use crate::flow::Step;
use crate::pattern::{BufferSpec, FillPolicy, GenerateOptions, SizeSpec};
use crate::util::units::deserialize_size;
use crate::{DiskPakError, Result, APP_NAME, CONFIG_FILE, DATA_FILE, GB, MB};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod persistence;

/// Everything a run needs besides the cancellation token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Data file written and read back on the disk under test
    pub data_path: PathBuf,
    /// Pattern buffer size, or "auto" to probe for the fastest size
    pub size: SizeSpec,
    pub fill: FillPolicy,
    /// Bytes per write/read call
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_size: u64,
    /// Progress log cadence in bytes
    #[serde(deserialize_with = "deserialize_size")]
    pub log_every: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    #[serde(with = "optional_duration", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Leave the data file on disk after writers and flows finish
    pub keep_data: bool,
    /// Fill every byte of large random buffers instead of tiling 1 MiB
    pub exact_generation: bool,
    pub steps: Vec<Step>,
    /// Disk usage polling interval; no monitor when unset
    #[serde(with = "optional_duration", skip_serializing_if = "Option::is_none")]
    pub monitor_poll: Option<Duration>,
    pub probe_repetitions: u32,
    #[serde(with = "humantime_duration")]
    pub probe_min_elapsed: Duration,
    /// Drive letters never deleted by the partition steps
    pub ignore_partitions: Vec<String>,
    /// Drive letters to delete; empty means every letter not ignored
    pub include_partitions: Vec<String>,
    /// Directory holding the partition scripts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_scripts: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let budget = ProbeBudget::default();
        Self {
            data_path: Self::default_data_path(),
            size: SizeSpec::Exact(MB),
            fill: FillPolicy::Random,
            chunk_size: MB,
            log_every: GB,
            iterations: Some(1),
            duration: None,
            keep_data: false,
            exact_generation: false,
            steps: vec![Step::Create, Step::WriteBurnin, Step::ReadSeq, Step::ReadRand],
            monitor_poll: None,
            probe_repetitions: budget.min_repetitions,
            probe_min_elapsed: budget.min_elapsed,
            ignore_partitions: vec!["C".to_string()],
            include_partitions: Vec::new(),
            partition_scripts: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<temp dir>/diskpak/data.dat`
    pub fn default_data_path() -> PathBuf {
        std::env::temp_dir().join(APP_NAME).join(DATA_FILE)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.data_path.as_os_str().is_empty() {
            return Err(DiskPakError::InvalidConfiguration(
                "Data path cannot be empty".to_string(),
            ));
        }

        if self.size == SizeSpec::Exact(0) {
            return Err(DiskPakError::InvalidConfiguration(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(DiskPakError::InvalidConfiguration(
                "Chunk size must be greater than 0".to_string(),
            ));
        }
        if usize::try_from(self.chunk_size).is_err() {
            return Err(DiskPakError::InvalidConfiguration(format!(
                "Chunk size {} does not fit in memory",
                self.chunk_size
            )));
        }

        if self.log_every == 0 {
            return Err(DiskPakError::InvalidConfiguration(
                "Log cadence must be greater than 0".to_string(),
            ));
        }

        if self.iterations == Some(0) {
            return Err(DiskPakError::InvalidConfiguration(
                "Iterations must be greater than 0 when set".to_string(),
            ));
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(DiskPakError::InvalidConfiguration(
                "Duration must be greater than 0 when set".to_string(),
            ));
        }

        if self.steps.is_empty() {
            return Err(DiskPakError::InvalidConfiguration(
                "A flow needs at least one step".to_string(),
            ));
        }

        if self.monitor_poll.is_some_and(|d| d.is_zero()) {
            return Err(DiskPakError::InvalidConfiguration(
                "Monitor poll interval must be greater than 0".to_string(),
            ));
        }

        if self.probe_repetitions == 0 {
            return Err(DiskPakError::InvalidConfiguration(
                "Probe repetitions must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    pub fn with_size(mut self, size: SizeSpec) -> Self {
        self.size = size;
        self
    }

    pub fn with_fill(mut self, fill: FillPolicy) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every;
        self
    }

    pub fn with_iterations(mut self, iterations: Option<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_keep_data(mut self, keep: bool) -> Self {
        self.keep_data = keep;
        self
    }

    pub fn with_exact_generation(mut self, exact: bool) -> Self {
        self.exact_generation = exact;
        self
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_monitor_poll(mut self, poll: Option<Duration>) -> Self {
        self.monitor_poll = poll;
        self
    }

    pub fn with_probe_budget(mut self, budget: ProbeBudget) -> Self {
        self.probe_repetitions = budget.min_repetitions;
        self.probe_min_elapsed = budget.min_elapsed;
        self
    }

    pub fn with_partition_scripts(mut self, dir: Option<PathBuf>) -> Self {
        self.partition_scripts = dir;
        self
    }

    /// Chunking and data retention for the writers and readers
    pub fn io_options(&self) -> IoOptions {
        IoOptions::default()
            .with_chunk_size(self.chunk_size as usize)
            .with_log_every(self.log_every)
            .with_keep_data(self.keep_data)
    }

    pub fn loop_spec(&self) -> LoopSpec {
        LoopSpec {
            iterations: self.iterations,
            duration: self.duration,
        }
    }

    pub fn buffer_spec(&self) -> BufferSpec {
        BufferSpec::new(self.size, self.fill)
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            exact: self.exact_generation,
        }
    }

    pub fn probe_budget(&self) -> ProbeBudget {
        ProbeBudget {
            min_repetitions: self.probe_repetitions,
            min_elapsed: self.probe_min_elapsed,
        }
    }

    /// Load configuration from the standard config file location
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&config_path)
    }

    /// Load and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DiskPakError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            DiskPakError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the standard config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DiskPakError::ConfigError(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            DiskPakError::ConfigError(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Get the standard configuration file path
    /// Uses $CONFIG_HOME/diskpak/diskpak.toml
    pub fn config_file_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            DiskPakError::ConfigError("Unable to determine config directory".to_string())
        })?;

        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}

// Durations are written as humantime strings ("1m 30s") and read from either
// such a string or a number of seconds.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum DurationValue {
        Seconds(f64),
        Text(String),
    }

    impl DurationValue {
        pub(super) fn into_duration(self) -> Result<Duration, String> {
            match self {
                DurationValue::Seconds(s) if s.is_finite() && s >= 0.0 => {
                    Ok(Duration::from_secs_f64(s))
                }
                DurationValue::Seconds(s) => Err(format!("invalid duration: {}", s)),
                DurationValue::Text(t) => humantime::parse_duration(&t).map_err(|e| e.to_string()),
            }
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        DurationValue::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

mod optional_duration {
    use super::humantime_duration::DurationValue;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::humantime_duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<DurationValue>::deserialize(deserializer)?
            .map(|v| v.into_duration().map_err(serde::de::Error::custom))
            .transpose()
    }
}
