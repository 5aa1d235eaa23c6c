use clap::{ArgAction, Args, Parser, Subcommand};
use diskpak::bench::looping::{Append, LoopController};
use diskpak::bench::probe::find_best_chunk;
use diskpak::bench::progress::ProgressUpdate;
use diskpak::bench::RunState;
use diskpak::cancel::CancellationToken;
use diskpak::config::persistence::ResultsStorage;
use diskpak::config::RunConfig;
use diskpak::error::user_friendly_message;
use diskpak::flow::monitor::spawn_disk_usage_monitor;
use diskpak::flow::partitions::ScriptPartitionManager;
use diskpak::flow::{FlowContext, FlowOrchestrator, Step};
use diskpak::io::disk::{create_disk_io, DiskIO};
use diskpak::models::{RunRecord, StepReport};
use diskpak::pattern::{FillPolicy, SizeSpec};
use diskpak::util::units::{format_bytes, format_rate, parse_bytes, parse_duration};
use diskpak::{DiskPakError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "diskpak")]
#[command(version, about = "Disk throughput benchmark and burn-in tool with integrity verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Do not append this run to the results history
    #[arg(long, global = true)]
    no_history: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build the pattern buffer and write the data file if it is missing
    Create(RunArgs),
    /// Find the buffer size with the best write throughput
    Probe(RunArgs),
    /// Write the buffer once to a fresh data file
    Burnin(RunArgs),
    /// Append the buffer to the data file until the disk is full
    Fulpak(RunArgs),
    /// Read the data file front to back and verify it
    ReadSeq(RunArgs),
    /// Read the data file in shuffled chunk order and verify it
    ReadRand(RunArgs),
    /// Run a sequence of steps until the iteration or duration bound
    Flow(FlowArgs),
    /// Show recorded runs
    History {
        /// Number of most recent runs to show
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// Delete the history file
        #[arg(long)]
        clear: bool,
    },
    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        run: RunArgs,
        /// Also save it to the user config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Data file on the disk under test
    #[arg(short = 'p', long)]
    data_path: Option<PathBuf>,

    /// Buffer size ("512MB", "4KiB") or "auto" to probe
    #[arg(short, long)]
    size: Option<SizeSpec>,

    /// "random" or a byte value 0-255
    #[arg(short, long)]
    fill: Option<FillPolicy>,

    /// Bytes per write/read call
    #[arg(long, value_parser = parse_bytes)]
    chunk_size: Option<u64>,

    /// Log progress every this many bytes
    #[arg(long, value_parser = parse_bytes)]
    log_every: Option<u64>,

    /// Loop iterations; negative for unbounded
    #[arg(short, long, allow_negative_numbers = true)]
    iterations: Option<i64>,

    /// Loop duration ("90", "1m30s"); without --iterations the loop runs for
    /// the whole duration. Negative for unbounded
    #[arg(short, long, allow_hyphen_values = true)]
    duration: Option<String>,

    /// Keep the data file afterwards
    #[arg(short, long)]
    keep: bool,

    /// Generate every byte of large random buffers
    #[arg(long)]
    exact: bool,
}

#[derive(Args, Debug, Clone)]
struct FlowArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Comma separated steps, e.g. create,write_burnin,read_seq
    #[arg(long, value_delimiter = ',')]
    steps: Vec<Step>,

    /// Poll disk usage at this interval while the flow runs
    #[arg(long)]
    monitor: Option<String>,

    /// Directory holding the partition scripts
    #[arg(long)]
    partition_scripts: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, mut config: RunConfig) -> Result<RunConfig> {
        if let Some(path) = &self.data_path {
            config = config.with_data_path(path);
        }
        if let Some(size) = self.size {
            config = config.with_size(size);
        }
        if let Some(fill) = self.fill {
            config = config.with_fill(fill);
        }
        if let Some(chunk) = self.chunk_size {
            config = config.with_chunk_size(chunk);
        }
        if let Some(every) = self.log_every {
            config = config.with_log_every(every);
        }
        if let Some(n) = self.iterations {
            config = config.with_iterations(u64::try_from(n).ok());
        }
        if let Some(d) = &self.duration {
            let duration = if d.trim_start().starts_with('-') {
                None
            } else {
                Some(parse_duration(d).map_err(DiskPakError::InvalidConfiguration)?)
            };
            // A duration alone bounds the loop by time only
            if duration.is_some() && self.iterations.is_none() {
                config = config.with_iterations(None);
            }
            config = config.with_duration(duration);
        }
        if self.keep {
            config = config.with_keep_data(true);
        }
        if self.exact {
            config = config.with_exact_generation(true);
        }
        Ok(config)
    }
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Create(_) => "create",
            Command::Probe(_) => "probe",
            Command::Burnin(_) => "burnin",
            Command::Fulpak(_) => "fulpak",
            Command::ReadSeq(_) => "read-seq",
            Command::ReadRand(_) => "read-rand",
            Command::Flow(_) => "flow",
            Command::History { .. } => "history",
            Command::Config { .. } => "config",
        }
    }

    /// Flow step run by a single-operation command
    fn step(&self) -> Option<Step> {
        match self {
            Command::Create(_) => Some(Step::Create),
            Command::Burnin(_) => Some(Step::WriteBurnin),
            Command::Fulpak(_) => Some(Step::WriteFulpak),
            Command::ReadSeq(_) => Some(Step::ReadSeq),
            Command::ReadRand(_) => Some(Step::ReadRand),
            _ => None,
        }
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("diskpak={}", level)));
    fmt().with_env_filter(filter).with_target(false).init();
    debug!("Logging initialized at level: {}", level);
}

fn load_config(cli: &Cli) -> Result<RunConfig> {
    match &cli.config {
        Some(path) => RunConfig::load_from(path),
        None => RunConfig::load(),
    }
}

/// Renders progress updates until every sender is dropped
async fn render_progress(mut rx: UnboundedReceiver<ProgressUpdate>) {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{prefix:>12} {spinner} {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);

    let mut current: Option<&'static str> = None;
    while let Some(update) = rx.recv().await {
        if current != Some(update.operation) {
            current = Some(update.operation);
            pb.reset();
            pb.set_prefix(update.operation);
            match update.total_bytes {
                Some(total) => pb.set_length(total),
                None => pb.unset_length(),
            }
        }
        pb.set_position(update.bytes_processed);
        pb.set_message(format_rate(update.bytes_per_sec));
        if update.finished {
            current = None;
        }
    }
    pb.finish_and_clear();
}

/// Blocking part of a run: everything that touches the disk
fn execute(
    command: &Command,
    config: &RunConfig,
    progress: Option<UnboundedSender<ProgressUpdate>>,
    cancel: &CancellationToken,
) -> Result<RunRecord> {
    let disk = create_disk_io();
    let scripts = config
        .partition_scripts
        .as_ref()
        .map(ScriptPartitionManager::powershell);
    let mut orchestrator = FlowOrchestrator::new(&disk, config).with_progress(progress);
    if let Some(manager) = &scripts {
        orchestrator = orchestrator.with_partitions(manager);
    }

    let start = Instant::now();
    let mut record = RunRecord::new(command.name(), &config.data_path);

    if let Command::Flow(_) = command {
        let run = orchestrator.run(cancel)?;
        record.iterations = run.iterations;
        record.cancelled = run.cancelled();
        record.buffer_size = run.context.buffer.as_ref().map(|b| b.len() as u64);
        record.reports = run.context.reports;
    } else if let Command::Probe(_) = command {
        let outcome = find_best_chunk(
            &disk,
            &config.data_path,
            config.fill,
            config.probe_budget(),
            cancel,
        )?;
        for sample in &outcome.samples {
            println!(
                "{:>10}  {:>10.3} MiB/s",
                format_bytes(sample.candidate_size_bytes),
                sample.rate_mb_per_sec
            );
        }
        record.iterations = 1;
        record.cancelled = cancel.is_cancelled();
        record.buffer_size = Some(outcome.buffer.len() as u64);
        record.reports.push(StepReport::note(
            "probe",
            format!(
                "sweet spot {} at {:.3} MiB/s",
                format_bytes(outcome.buffer.len() as u64),
                outcome.rate_mb_per_sec
            ),
        ));
    } else if let Some(step) = command.step() {
        let removes_data = matches!(step, Step::WriteBurnin | Step::WriteFulpak) && !config.keep_data;
        let disk_ref: &dyn DiskIO = &disk;
        let mut context = FlowContext::default();
        let outcome = LoopController::new(command.name(), cancel)
            .with_cleanup(|| {
                if removes_data && disk_ref.file_size(&config.data_path).is_ok() {
                    warn!("removing data file \"{}\"", config.data_path.display());
                    if let Err(e) = disk_ref.remove(&config.data_path) {
                        warn!("could not remove data file: {}", e);
                    }
                }
            })
            .run_bounded(config.loop_spec(), Append::default(), || {
                orchestrator.run_step(step, &mut context, cancel)
            })?;
        record.iterations = outcome.iterations;
        record.cancelled = cancel.is_cancelled()
            || outcome.result.iter().any(|r| r.stats.is_some_and(|s| s.cancelled));
        record.buffer_size = context.buffer.as_ref().map(|b| b.len() as u64);
        record.reports = outcome.result;
    }

    record.elapsed = start.elapsed();
    Ok(record)
}

async fn run(cli: Cli) -> Result<RunState> {
    let mut config = load_config(&cli)?;
    let run_args = match &cli.command {
        Command::History { count, clear } => {
            let storage = ResultsStorage::new()?;
            if *clear {
                storage.clear_results()?;
                println!("Cleared {}", storage.path().display());
            } else {
                for record in storage.get_recent_results(*count)? {
                    println!("{}", record.summary());
                    for report in &record.reports {
                        println!("    {}", report.summary());
                    }
                }
            }
            return Ok(RunState::Completed);
        }
        Command::Config { run, save } => {
            let config = run.apply(config)?;
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            if *save {
                config.save()?;
                eprintln!("Saved to {}", RunConfig::config_file_path()?.display());
            }
            return Ok(RunState::Completed);
        }
        Command::Flow(flow) => {
            if !flow.steps.is_empty() {
                config = config.with_steps(flow.steps.clone());
            }
            if let Some(poll) = &flow.monitor {
                let poll = parse_duration(poll).map_err(DiskPakError::InvalidConfiguration)?;
                config = config.with_monitor_poll(Some(poll));
            }
            if flow.partition_scripts.is_some() {
                config = config.with_partition_scripts(flow.partition_scripts.clone());
            }
            &flow.run
        }
        Command::Create(args)
        | Command::Probe(args)
        | Command::Burnin(args)
        | Command::Fulpak(args)
        | Command::ReadSeq(args)
        | Command::ReadRand(args) => args,
    };
    let config = run_args.apply(config)?;
    config.validate()?;

    if let Some(parent) = config.data_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next chunk");
            interrupt.cancel();
        }
    });

    let (tx, renderer) = if cli.quiet {
        (None, None)
    } else {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(tokio::spawn(render_progress(rx))))
    };

    let monitor = match (&cli.command, config.monitor_poll) {
        (Command::Flow(_), Some(poll)) => Some(spawn_disk_usage_monitor(
            Arc::new(create_disk_io()),
            config.data_path.clone(),
            poll,
            cancel.clone(),
        )),
        _ => None,
    };

    let mut state = RunState::Running;
    info!("{} on \"{}\" ({:?})", cli.command.name(), config.data_path.display(), state);

    let command = cli.command;
    let core_config = config.clone();
    let core_cancel = cancel.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        execute(&command, &core_config, tx, &core_cancel)
    })
    .await
    .map_err(|e| DiskPakError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    state = match &outcome {
        Ok(record) => RunState::finished(record.cancelled),
        Err(e) => RunState::from_error(e),
    };
    let record = match outcome {
        Ok(record) => record,
        Err(e) if state.is_clean() => {
            eprintln!("{}", user_friendly_message(&e));
            return Ok(state);
        }
        Err(e) => return Err(e),
    };

    println!("{}", record.summary());
    for report in &record.reports {
        println!("  {}", report.summary());
    }

    if !cli.no_history {
        match ResultsStorage::new().and_then(|s| s.append_result(record)) {
            Ok(()) => debug!("run recorded"),
            Err(e) => warn!("{}", user_friendly_message(&e)),
        }
    }

    Ok(state)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(state) => {
            debug!("finished: {:?}", state);
            if state.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {}", user_friendly_message(&e));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn flow_config(args: &[&str]) -> RunConfig {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Flow(flow) => flow.run.apply(RunConfig::default()).unwrap(),
            _ => panic!("expected the flow command"),
        }
    }

    #[test]
    fn test_compound_duration_argument() {
        let config = flow_config(&["diskpak", "flow", "-d", "1m30s"]);
        assert_eq!(config.duration, Some(Duration::from_secs(90)));

        let config = flow_config(&["diskpak", "flow", "--duration", "1h 5m"]);
        assert_eq!(config.duration, Some(Duration::from_secs(3900)));
    }

    #[test]
    fn test_duration_alone_drops_iteration_bound() {
        let config = flow_config(&["diskpak", "flow", "-d", "60"]);
        assert_eq!(config.iterations, None);
        assert!(config.validate().is_ok());

        let config = flow_config(&["diskpak", "flow", "-d", "60", "-i", "3"]);
        assert_eq!(config.iterations, Some(3));
        assert_eq!(config.duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_negative_bounds_mean_unbounded() {
        let config = flow_config(&["diskpak", "flow", "-i", "-1", "-d", "30s"]);
        assert_eq!(config.iterations, None);
        assert_eq!(config.duration, Some(Duration::from_secs(30)));

        let config = flow_config(&["diskpak", "flow", "-d", "-1"]);
        assert_eq!(config.duration, None);
        assert_eq!(config.iterations, Some(1));
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let cli = Cli::try_parse_from(["diskpak", "burnin", "-d", "soon"]).unwrap();
        match cli.command {
            Command::Burnin(args) => assert!(args.apply(RunConfig::default()).is_err()),
            _ => panic!("expected the burnin command"),
        }
    }
}
