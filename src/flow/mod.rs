//! Multi-step flows
//!
//! A flow runs configured steps in order, threading a [`FlowContext`]
//! between them, and repeats the whole sequence until the iteration or
//! duration bound is reached. Write steps inside a flow always leave the data
//! file in place for the steps after them; the flow removes it at the end
//! unless `keep_data` is set.

pub mod monitor;
pub mod partitions;

use crate::bench::looping::{LoopController, Singleton, StopReason};
use crate::bench::probe::find_best_chunk;
use crate::bench::progress::ProgressUpdate;
use crate::bench::read::load_data_file;
use crate::bench::{read_rand, read_seq, write_burnin, write_fulpak, IoOptions};
use crate::cancel::CancellationToken;
use crate::config::RunConfig;
use crate::io::disk::DiskIO;
use crate::models::StepReport;
use crate::pattern::{generate_with, PatternBuffer, SizeSpec};
use crate::util::units::format_bytes;
use crate::{DiskPakError, Result, MAX_LOADED_BUFFER};
use partitions::PartitionManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// One named operation in a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Build (or probe for) the pattern buffer and write the data file if missing
    Create,
    WriteBurnin,
    WriteFulpak,
    ReadSeq,
    ReadRand,
    DeletePartitions,
    CreatePartitions,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Create,
        Step::WriteBurnin,
        Step::WriteFulpak,
        Step::ReadSeq,
        Step::ReadRand,
        Step::DeletePartitions,
        Step::CreatePartitions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Create => "create",
            Step::WriteBurnin => "write_burnin",
            Step::WriteFulpak => "write_fulpak",
            Step::ReadSeq => "read_seq",
            Step::ReadRand => "read_rand",
            Step::DeletePartitions => "delete_partitions",
            Step::CreatePartitions => "create_partitions",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = String;

    /// Step names, with `-` accepted in place of `_`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Step::ALL
            .iter()
            .copied()
            .find(|step| step.name() == normalized)
            .ok_or_else(|| {
                let names: Vec<_> = Step::ALL.iter().map(Step::name).collect();
                format!("Unknown step '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

/// State handed from step to step
#[derive(Debug, Default)]
pub struct FlowContext {
    /// Buffer written by the last write step, reused while it still matches
    pub buffer: Option<PatternBuffer>,
    /// Disks left raw by `delete_partitions`
    pub disk_numbers: Vec<String>,
    /// Disk number to drive letter from `create_partitions`
    pub disk_map: BTreeMap<String, String>,
    /// Every step report, across all iterations
    pub reports: Vec<StepReport>,
}

/// Result of [`FlowOrchestrator::run`]
#[derive(Debug)]
pub struct FlowRun {
    pub context: FlowContext,
    /// Reports of the last iteration that completed
    pub last_iteration: Option<Vec<StepReport>>,
    pub iterations: u64,
    pub elapsed: Duration,
    pub stop: StopReason,
}

impl FlowRun {
    pub fn cancelled(&self) -> bool {
        self.stop == StopReason::Cancelled
    }
}

/// Runs single steps or whole flows against one data file
pub struct FlowOrchestrator<'a> {
    disk: &'a dyn DiskIO,
    config: &'a RunConfig,
    partitions: Option<&'a dyn PartitionManager>,
    progress: Option<UnboundedSender<ProgressUpdate>>,
}

impl<'a> FlowOrchestrator<'a> {
    pub fn new(disk: &'a dyn DiskIO, config: &'a RunConfig) -> Self {
        Self {
            disk,
            config,
            partitions: None,
            progress: None,
        }
    }

    pub fn with_partitions(mut self, manager: &'a dyn PartitionManager) -> Self {
        self.partitions = Some(manager);
        self
    }

    pub fn with_progress(mut self, tx: Option<UnboundedSender<ProgressUpdate>>) -> Self {
        self.progress = tx;
        self
    }

    /// Repeat the configured steps until the loop bound is reached.
    ///
    /// Reaching the iteration bound sets `cancel`, as does the duration timer.
    pub fn run(&self, cancel: &CancellationToken) -> Result<FlowRun> {
        self.config.validate()?;
        let steps = &self.config.steps;
        let names: Vec<_> = steps.iter().map(Step::name).collect();
        info!("flow: {}", names.join(" -> "));

        let disk = self.disk;
        let data_path = &self.config.data_path;
        let keep_data = self.config.keep_data;
        let mut context = FlowContext::default();

        let outcome = LoopController::new(format!("flow [{}]", names.join(", ")), cancel)
            .with_cleanup(move || {
                if keep_data || disk.file_size(data_path).is_err() {
                    return;
                }
                match disk.remove(data_path) {
                    Ok(()) => info!("deleted data file \"{}\"", data_path.display()),
                    Err(e) => warn!("could not delete data file \"{}\": {}", data_path.display(), e),
                }
            })
            .run_either(self.config.loop_spec(), Singleton::default(), || {
                self.run_iteration(steps, &mut context, cancel)
            })?;

        Ok(FlowRun {
            context,
            last_iteration: outcome.result,
            iterations: outcome.iterations,
            elapsed: outcome.elapsed,
            stop: outcome.stop,
        })
    }

    /// Run `steps` once, stopping between steps when cancelled
    pub fn run_iteration(
        &self,
        steps: &[Step],
        context: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(steps.len());
        for (k, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("flow stopped before {}", step);
                break;
            }
            info!("{} / {} - {}", k + 1, steps.len(), step);
            let report = self.run_step(*step, context, cancel)?;
            info!("{}", report.summary());
            context.reports.push(report.clone());
            reports.push(report);
        }
        Ok(reports)
    }

    /// Run one step, updating `context` with what it produced
    pub fn run_step(
        &self,
        step: Step,
        context: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        let path = &self.config.data_path;
        match step {
            Step::Create => self.create(context, cancel),
            Step::WriteBurnin => {
                let buffer = self.acquire_buffer(context, cancel)?;
                let stats = write_burnin(self.disk, &buffer, path, &self.step_options(), cancel)?;
                Ok(StepReport::io(step.name(), stats))
            }
            Step::WriteFulpak => {
                let buffer = self.acquire_buffer(context, cancel)?;
                let stats = write_fulpak(self.disk, &buffer, path, &self.step_options(), cancel)?;
                Ok(StepReport::io(step.name(), stats))
            }
            Step::ReadSeq => {
                let expected = self.expected_buffer(context, cancel)?;
                let stats = read_seq(self.disk, &expected, path, &self.step_options(), cancel)?;
                Ok(StepReport::io(step.name(), stats))
            }
            Step::ReadRand => {
                let expected = self.expected_buffer(context, cancel)?;
                let stats = read_rand(self.disk, &expected, path, &self.step_options(), cancel)?;
                Ok(StepReport::io(step.name(), stats))
            }
            Step::DeletePartitions => {
                let numbers = self.partition_manager()?.delete_partitions(
                    &self.config.ignore_partitions,
                    &self.config.include_partitions,
                )?;
                let note = format!("disk numbers {:?}", numbers);
                context.disk_numbers = numbers;
                Ok(StepReport::note(step.name(), note))
            }
            Step::CreatePartitions => {
                let created = self
                    .partition_manager()?
                    .create_partitions(&context.disk_numbers)?;
                let note = format!("created {:?}", created);
                context.disk_map = created;
                Ok(StepReport::note(step.name(), note))
            }
        }
    }

    /// Buffer for the configured size and fill: reused from `context` when it
    /// matches, otherwise probed (`auto`) or generated.
    pub fn acquire_buffer(
        &self,
        context: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Result<PatternBuffer> {
        let spec = self.config.buffer_spec();
        if let Some(buffer) = context.buffer.as_ref().filter(|b| b.matches(&spec)) {
            debug!("reusing {} buffer", format_bytes(buffer.len() as u64));
            return Ok(buffer.clone());
        }

        let buffer = match spec.size {
            SizeSpec::Auto => {
                find_best_chunk(
                    self.disk,
                    &self.config.data_path,
                    spec.fill,
                    self.config.probe_budget(),
                    cancel,
                )?
                .buffer
            }
            SizeSpec::Exact(size) => {
                generate_with(size, spec.fill, self.config.generate_options(), cancel)?
            }
        };
        context.buffer = Some(buffer.clone());
        Ok(buffer)
    }

    /// Create the buffer and write it to the data file unless one exists
    fn create(&self, context: &mut FlowContext, cancel: &CancellationToken) -> Result<StepReport> {
        let buffer = self.acquire_buffer(context, cancel)?;
        let path = &self.config.data_path;
        let written = if self.disk.file_size(path).is_ok() {
            debug!("data file \"{}\" already exists, leaving it", path.display());
            false
        } else {
            write_burnin(self.disk, &buffer, path, &self.step_options(), cancel)?;
            true
        };

        Ok(StepReport::note(
            Step::Create.name(),
            format!(
                "{} {} buffer{}",
                format_bytes(buffer.len() as u64),
                buffer.fill(),
                if written { ", data file written" } else { "" }
            ),
        ))
    }

    /// What reads compare against: the cached buffer, else the data file's
    /// own content, else a freshly created data file.
    fn expected_buffer(
        &self,
        context: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Result<PatternBuffer> {
        if let Some(buffer) = &context.buffer {
            return Ok(buffer.clone());
        }
        let path = &self.config.data_path;
        if self.disk.file_size(path).is_ok() {
            let buffer = load_data_file(self.disk, path, MAX_LOADED_BUFFER)?;
            context.buffer = Some(buffer.clone());
            return Ok(buffer);
        }
        self.create(context, cancel)?;
        context.buffer.clone().ok_or_else(|| {
            DiskPakError::InvalidConfiguration("No buffer available for reading".to_string())
        })
    }

    fn step_options(&self) -> IoOptions {
        self.config
            .io_options()
            .with_keep_data(true)
            .with_progress(self.progress.clone())
    }

    fn partition_manager(&self) -> Result<&'a dyn PartitionManager> {
        self.partitions.ok_or_else(|| {
            DiskPakError::PartitionError(
                "No partition manager configured; set partition_scripts".to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::probe::ProbeBudget;
    use crate::io::memory::MemoryDiskIO;
    use crate::pattern::{BufferSource, FillPolicy};
    use crate::{KB, MB};
    use std::path::Path;
    use std::sync::Mutex;

    const DATA: &str = "/mem/data.dat";

    fn config(steps: Vec<Step>) -> RunConfig {
        RunConfig::default()
            .with_data_path(DATA)
            .with_size(SizeSpec::Exact(16 * KB))
            .with_fill(FillPolicy::Constant(42))
            .with_chunk_size(4 * KB)
            .with_steps(steps)
    }

    #[derive(Default)]
    struct FakePartitions {
        created_for: Mutex<Vec<String>>,
    }

    impl PartitionManager for FakePartitions {
        fn delete_partitions(&self, ignore: &[String], _include: &[String]) -> Result<Vec<String>> {
            assert_eq!(ignore, ["C".to_string()]);
            Ok(vec!["1".to_string(), "2".to_string()])
        }

        fn create_partitions(&self, disk_numbers: &[String]) -> Result<BTreeMap<String, String>> {
            *self.created_for.lock().unwrap() = disk_numbers.to_vec();
            Ok(disk_numbers
                .iter()
                .zip(["D:", "E:"])
                .map(|(n, l)| (n.clone(), l.to_string()))
                .collect())
        }
    }

    #[test]
    fn test_step_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(step.name().parse::<Step>().unwrap(), step);
        }
        assert_eq!("write-burnin".parse::<Step>().unwrap(), Step::WriteBurnin);
        assert!("format".parse::<Step>().is_err());
    }

    #[test]
    fn test_flow_write_then_read() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::Create, Step::WriteBurnin, Step::ReadSeq, Step::ReadRand]);
        let token = CancellationToken::new();

        let run = FlowOrchestrator::new(&disk, &config).run(&token).unwrap();

        assert_eq!(run.iterations, 1);
        assert_eq!(run.stop, StopReason::IterationLimit);
        let reports = run.last_iteration.unwrap();
        let names: Vec<_> = reports.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(names, ["create", "write_burnin", "read_seq", "read_rand"]);
        for report in &reports[1..] {
            assert_eq!(report.stats.unwrap().bytes_transferred, 16 * KB);
        }
        // Reaching the iteration bound stops anything else on the token
        assert!(token.is_cancelled());
        // Data file removed by the flow's cleanup
        assert!(disk.contents(Path::new(DATA)).is_none());
    }

    #[test]
    fn test_flow_keep_data_and_iterations() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::WriteBurnin, Step::ReadSeq])
            .with_iterations(Some(3))
            .with_keep_data(true);

        let run = FlowOrchestrator::new(&disk, &config)
            .run(&CancellationToken::new())
            .unwrap();

        assert_eq!(run.iterations, 3);
        assert_eq!(run.context.reports.len(), 6);
        assert_eq!(disk.contents(Path::new(DATA)).unwrap(), vec![42u8; 16 * KB as usize]);
    }

    #[test]
    fn test_buffer_reused_while_matching() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::Create]);
        let orchestrator = FlowOrchestrator::new(&disk, &config);
        let token = CancellationToken::new();
        let mut context = FlowContext::default();

        let first = orchestrator.acquire_buffer(&mut context, &token).unwrap();
        let second = orchestrator.acquire_buffer(&mut context, &token).unwrap();
        assert!(std::ptr::eq(first.as_bytes(), second.as_bytes()));

        // A loaded buffer never stands in for a generated one
        context.buffer = Some(PatternBuffer::loaded(vec![42; 16 * KB as usize]).unwrap());
        let third = orchestrator.acquire_buffer(&mut context, &token).unwrap();
        assert_eq!(third.source(), BufferSource::Generated);
    }

    #[test]
    fn test_create_leaves_existing_data_file() {
        let disk = MemoryDiskIO::with_capacity(MB);
        disk.insert(Path::new(DATA), vec![1; 100]);
        let config = config(vec![Step::Create]);
        let mut context = FlowContext::default();

        let report = FlowOrchestrator::new(&disk, &config)
            .run_step(Step::Create, &mut context, &CancellationToken::new())
            .unwrap();

        assert!(!report.note.unwrap().contains("written"));
        assert_eq!(disk.contents(Path::new(DATA)).unwrap().len(), 100);
        assert_eq!(context.buffer.unwrap().len() as u64, 16 * KB);
    }

    #[test]
    fn test_read_without_buffer_loads_data_file() {
        let disk = MemoryDiskIO::with_capacity(MB);
        disk.insert(Path::new(DATA), vec![5; 8192]);
        let config = config(vec![Step::ReadSeq]);
        let mut context = FlowContext::default();

        let report = FlowOrchestrator::new(&disk, &config)
            .run_step(Step::ReadSeq, &mut context, &CancellationToken::new())
            .unwrap();

        assert_eq!(report.stats.unwrap().bytes_transferred, 8192);
        assert_eq!(context.buffer.unwrap().source(), BufferSource::Loaded);
    }

    #[test]
    fn test_read_without_buffer_or_file_creates_one() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::ReadRand]);
        let mut context = FlowContext::default();

        let report = FlowOrchestrator::new(&disk, &config)
            .run_step(Step::ReadRand, &mut context, &CancellationToken::new())
            .unwrap();

        assert_eq!(report.stats.unwrap().bytes_transferred, 16 * KB);
    }

    #[test]
    fn test_fulpak_flow_round_trip() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::WriteFulpak, Step::ReadSeq, Step::ReadRand]);

        let run = FlowOrchestrator::new(&disk, &config)
            .run(&CancellationToken::new())
            .unwrap();

        // The last repetition does not fit once only one buffer's worth is free
        let filled = MB - 16 * KB;
        let reports = run.last_iteration.unwrap();
        for report in &reports {
            assert_eq!(report.stats.unwrap().bytes_transferred, filled, "{}", report.step);
        }
    }

    #[test]
    fn test_repeated_fulpak_flow_rewrites_data_file() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::WriteFulpak, Step::ReadSeq]).with_iterations(Some(2));

        let run = FlowOrchestrator::new(&disk, &config)
            .run(&CancellationToken::new())
            .unwrap();

        assert_eq!(run.iterations, 2);
        let reports = run.last_iteration.unwrap();
        let write = reports[0].stats.unwrap();
        assert_eq!(write.bytes_transferred, MB - 16 * KB);
        assert_eq!(write.operations, 63 * 4);
        assert_eq!(reports[1].stats.unwrap().bytes_transferred, MB - 16 * KB);
    }

    #[test]
    fn test_partition_steps_thread_disk_numbers() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let manager = FakePartitions::default();
        let config = config(vec![Step::DeletePartitions, Step::CreatePartitions]);

        let run = FlowOrchestrator::new(&disk, &config)
            .with_partitions(&manager)
            .run(&CancellationToken::new())
            .unwrap();

        assert_eq!(run.context.disk_numbers, ["1", "2"]);
        assert_eq!(*manager.created_for.lock().unwrap(), ["1", "2"]);
        assert_eq!(run.context.disk_map.get("2").map(String::as_str), Some("E:"));
    }

    #[test]
    fn test_partition_step_without_manager_fails() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::DeletePartitions]);

        let err = FlowOrchestrator::new(&disk, &config)
            .run(&CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, DiskPakError::PartitionError(_)));
    }

    #[test]
    fn test_cancelled_flow_skips_remaining_steps() {
        let disk = MemoryDiskIO::with_capacity(MB);
        let config = config(vec![Step::WriteBurnin, Step::ReadSeq])
            .with_chunk_size(KB)
            .with_iterations(Some(10));
        let token = CancellationToken::new();
        // Cancel in the middle of the first write
        disk.cancel_after_writes(4, token.clone());

        let run = FlowOrchestrator::new(&disk, &config).run(&token).unwrap();

        assert!(run.cancelled());
        assert_eq!(run.iterations, 1);
        let reports = run.last_iteration.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].stats.unwrap().cancelled);
    }

    #[test]
    fn test_auto_size_probes_once() {
        let disk = MemoryDiskIO::with_capacity(256 * MB);
        let config = config(vec![Step::Create, Step::WriteBurnin])
            .with_size(SizeSpec::Auto)
            .with_probe_budget(ProbeBudget {
                min_repetitions: 1,
                min_elapsed: Duration::ZERO,
            });
        let mut context = FlowContext::default();
        let orchestrator = FlowOrchestrator::new(&disk, &config);
        let token = CancellationToken::new();

        orchestrator.run_step(Step::Create, &mut context, &token).unwrap();
        let probed = context.buffer.clone().unwrap();
        assert_eq!(probed.source(), BufferSource::Probed);

        let writes_before = disk.writes();
        orchestrator.run_step(Step::WriteBurnin, &mut context, &token).unwrap();
        // Only the burn-in itself wrote; no second probe
        let chunks = (probed.len() as u64).div_ceil(4 * KB);
        assert_eq!(disk.writes() - writes_before, chunks);
    }
}
