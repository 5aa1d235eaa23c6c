//! Partition management through platform scripts
//!
//! The scripts do the OS-specific work and print JSON; this module only
//! runs them and interprets their output.

use crate::{DiskPakError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Marker printed by the create script right before its JSON result
pub const CREATE_OUTPUT_SENTINEL: &str = "Begin Output Parsing Here:";

/// Removes and recreates partitions on the disks under test
pub trait PartitionManager: Send + Sync {
    /// Delete partitions, returning the numbers of the disks left raw.
    ///
    /// With `include` empty, every partition whose letter is not in `ignore`
    /// is deleted.
    fn delete_partitions(&self, ignore: &[String], include: &[String]) -> Result<Vec<String>>;

    /// Partition raw disks (all of them when `disk_numbers` is empty),
    /// returning disk number to drive letter.
    fn create_partitions(&self, disk_numbers: &[String]) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Deserialize)]
struct PartitionEntry {
    #[serde(rename = "DiskNumber")]
    disk_number: serde_json::Value,
}

/// Drive letters to delete and their disk numbers from a partition listing
/// shaped like `{"D": {"DiskNumber": 1, ...}, ...}`.
pub fn parse_partition_listing(
    json: &str,
    ignore: &[String],
) -> Result<(Vec<String>, Vec<String>)> {
    let listing: BTreeMap<String, PartitionEntry> = serde_json::from_str(json)
        .map_err(|e| DiskPakError::PartitionError(format!("Unreadable partition listing: {}", e)))?;

    let mut letters = Vec::new();
    let mut disk_numbers = Vec::new();
    for (letter, entry) in listing {
        if ignore.iter().any(|i| i.eq_ignore_ascii_case(&letter)) {
            continue;
        }
        letters.push(letter);
        disk_numbers.push(value_to_string(&entry.disk_number));
    }
    Ok((letters, disk_numbers))
}

/// Disk number to drive letter map from the create script's output.
///
/// Everything before [`CREATE_OUTPUT_SENTINEL`] is progress chatter. A disk
/// mapped to `null` failed to partition.
pub fn parse_created_partitions(output: &str) -> Result<BTreeMap<String, String>> {
    let json = match output.find(CREATE_OUTPUT_SENTINEL) {
        Some(at) => &output[at + CREATE_OUTPUT_SENTINEL.len()..],
        None => output,
    }
    .trim();

    let raw: BTreeMap<String, Option<String>> = serde_json::from_str(json)
        .map_err(|e| DiskPakError::PartitionError(format!("Unreadable create output: {}", e)))?;

    raw.into_iter()
        .map(|(disk, letter)| match letter {
            Some(letter) => Ok((disk, letter)),
            None => Err(DiskPakError::PartitionError(format!(
                "Drive {} was unable to create a partition",
                disk
            ))),
        })
        .collect()
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs `read-partitions`, `delete-partitions`, `create-partitions` and
/// `admin` scripts from a directory with a script interpreter.
#[derive(Debug, Clone)]
pub struct ScriptPartitionManager {
    interpreter: String,
    script_dir: PathBuf,
    extension: String,
}

impl ScriptPartitionManager {
    /// PowerShell scripts (`*.ps1`) in `script_dir`
    pub fn powershell(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: "powershell".to_string(),
            script_dir: script_dir.into(),
            extension: "ps1".to_string(),
        }
    }

    pub fn new(
        interpreter: impl Into<String>,
        script_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script_dir: script_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    fn script(&self, name: &str) -> PathBuf {
        self.script_dir.join(format!("{}.{}", name, self.extension))
    }

    fn run(&self, name: &str, args: &[String]) -> Result<String> {
        let script = self.script(name);
        debug!("{} {} {}", self.interpreter, script.display(), args.join(" "));
        let output = Command::new(&self.interpreter)
            .arg(&script)
            .args(args)
            .output()
            .map_err(|e| {
                DiskPakError::PartitionError(format!("Failed to run {}: {}", script.display(), e))
            })?;

        if !output.status.success() {
            return Err(DiskPakError::PartitionError(format!(
                "{} exited with {}: {}",
                script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn require_admin(&self) -> Result<()> {
        match self.run("admin", &[]) {
            Ok(_) => {
                info!("admin detected");
                Ok(())
            }
            Err(e) => {
                warn!("not admin: {}", e);
                Err(DiskPakError::PermissionDenied(
                    "Partition management must be run as administrator or root".to_string(),
                ))
            }
        }
    }
}

impl PartitionManager for ScriptPartitionManager {
    fn delete_partitions(&self, ignore: &[String], include: &[String]) -> Result<Vec<String>> {
        self.require_admin()?;

        let mut letters = include.to_vec();
        let mut disk_numbers = Vec::new();
        if letters.is_empty() {
            let listing = self.run("read-partitions", &[])?;
            let (found, numbers) = parse_partition_listing(&listing, ignore)?;
            info!("disk numbers to be removed after filtering {:?}: {:?}", ignore, numbers);
            letters = found;
            disk_numbers = numbers;
        }

        if !letters.is_empty() {
            let output = self.run(
                "delete-partitions",
                &["-DriveLetters".to_string(), letters.join(",")],
            )?;
            debug!("{}", output.trim());
            info!("deleted partitions {:?}, disk numbers: {:?}", letters, disk_numbers);
        }
        Ok(disk_numbers)
    }

    fn create_partitions(&self, disk_numbers: &[String]) -> Result<BTreeMap<String, String>> {
        self.require_admin()?;

        let mut args = Vec::new();
        if !disk_numbers.is_empty() {
            args.push("-DiskNumbers".to_string());
            args.push(disk_numbers.join(","));
        }
        let output = self.run("create-partitions", &args)?;
        let created = parse_created_partitions(&output)?;
        info!("created new partitions: {:?}", created);
        Ok(created)
    }
}
