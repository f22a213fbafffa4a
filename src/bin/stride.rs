//! Stride CLI - Command-line interface for the Stride pipeline
//!
//! Commands:
//! - run: Process a log of platform records through the partitioned pipeline
//! - normalize: Map platform records to normalized events without touching state
//! - inspect: Dump persisted per-user state
//! - doctor: Diagnose configuration and state directory health

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stride::store::{PartitionStore, UserState, CURRENT_SCHEMA_VERSION};
use stride::{
    normalize_record, partition_for, ConfigError, EmissionSink, FanoutSink, LogRecord,
    NdjsonSink, NotificationLogSink, PartitionReport, PartitionedRuntime, PipelineConfig,
    ProcessError, PRODUCER_NAME, STRIDE_VERSION,
};

/// Stride - Daily step windows, weekly activity signals and debounced notifications
#[derive(Parser)]
#[command(name = "stride")]
#[command(version = STRIDE_VERSION)]
#[command(about = "Process per-user activity streams into step signals and notifications", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process log records through the partitioned pipeline
    Run {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Only write these topics (repeatable)
        #[arg(long)]
        topic: Vec<String>,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Map platform records to normalized events
    Normalize {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Dump persisted per-user state as JSON
    Inspect {
        /// Only this user
        #[arg(long)]
        user: Option<String>,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Diagnose configuration and state directory health
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

/// Flags that override values loaded from the environment
#[derive(Args, Default)]
struct ConfigOverrides {
    /// State directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Number of partitions
    #[arg(long)]
    partitions: Option<u32>,

    /// Window size in seconds
    #[arg(long)]
    window_size_secs: Option<i64>,

    /// Window grace period in seconds
    #[arg(long)]
    window_grace_secs: Option<i64>,

    /// Days kept in the rolling history
    #[arg(long)]
    history_depth: Option<usize>,

    /// Minimum seconds between two notifications for a user
    #[arg(long)]
    debounce_secs: Option<i64>,

    /// Notification payload template
    #[arg(long)]
    template: Option<String>,
}

impl ConfigOverrides {
    fn load(self) -> Result<PipelineConfig, CliFailure> {
        let mut config = PipelineConfig::from_env()?;
        if let Some(v) = self.state_dir {
            config.state_dir = v;
        }
        if let Some(v) = self.partitions {
            config.partitions = v;
        }
        if let Some(v) = self.window_size_secs {
            config.window_size_secs = v;
        }
        if let Some(v) = self.window_grace_secs {
            config.window_grace_secs = v;
        }
        if let Some(v) = self.history_depth {
            config.history_depth = v;
        }
        if let Some(v) = self.debounce_secs {
            config.debounce_threshold_secs = v;
        }
        if let Some(v) = self.template {
            config.notification_template = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays a clean NDJSON stream.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .flatten_event(true)
            .with_writer(io::stderr)
    });
    let text_layer = (!json).then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

fn run(command: Commands) -> Result<(), CliFailure> {
    match command {
        Commands::Run {
            input,
            output,
            topic,
            overrides,
        } => cmd_run(&input, &output, topic, overrides.load()?),
        Commands::Normalize { input, output } => {
            cmd_normalize(&input, &output, &ConfigOverrides::default().load()?)
        }
        Commands::Inspect { user, overrides } => cmd_inspect(user.as_deref(), &overrides.load()?),
        Commands::Doctor { json, overrides } => cmd_doctor(overrides, json),
    }
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>, CliFailure> {
    if path.to_string_lossy() == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

fn open_output(path: &Path) -> Result<Box<dyn Write + Send>, CliFailure> {
    if path.to_string_lossy() == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

fn cmd_run(
    input: &Path,
    output: &Path,
    topics: Vec<String>,
    config: PipelineConfig,
) -> Result<(), CliFailure> {
    let sink: Arc<dyn EmissionSink> = Arc::new(
        FanoutSink::new()
            .with(NotificationLogSink)
            .with(NdjsonSink::new(open_output(output)?).with_topics(topics)),
    );
    let runtime = PartitionedRuntime::start(&config, sink)?;

    let mut skipped = 0usize;
    for (index, line) in open_input(input)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match LogRecord::from_json_line(&line) {
            Ok(record) => runtime.submit(record)?,
            Err(err) => {
                skipped += 1;
                warn!(line = index + 1, error = %err, "skipping unreadable log line");
            }
        }
    }

    let reports = runtime.shutdown();
    let summary = RunSummary {
        skipped_lines: skipped,
        partitions: reports,
    };
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);

    let halted = summary.partitions.iter().filter(|r| r.halted.is_some()).count();
    if halted > 0 {
        Err(CliFailure::PartitionsHalted(halted))
    } else {
        Ok(())
    }
}

fn cmd_normalize(input: &Path, output: &Path, config: &PipelineConfig) -> Result<(), CliFailure> {
    let mut out = open_output(output)?;
    // Timestamps are inherited within a partition, as in `run`
    let mut last_time: HashMap<u32, DateTime<Utc>> = HashMap::new();
    let mut failed = 0usize;

    for (index, line) in open_input(input)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let normalized = LogRecord::from_json_line(&line).and_then(|record| {
            let partition = partition_for(&record.key, config.partitions);
            let event = normalize_record(&record, last_time.get(&partition).copied())?;
            last_time.insert(partition, event.timestamp);
            Ok(event)
        });
        match normalized {
            Ok(event) => {
                serde_json::to_writer(&mut out, &event)?;
                out.write_all(b"\n")?;
            }
            Err(err) => {
                failed += 1;
                warn!(line = index + 1, error = %err, "record cannot be normalized");
            }
        }
    }
    out.flush()?;

    if failed > 0 {
        eprintln!("{failed} record(s) could not be normalized");
    }
    Ok(())
}

fn cmd_inspect(user: Option<&str>, config: &PipelineConfig) -> Result<(), CliFailure> {
    let partitions: Vec<u32> = match user {
        Some(user) => vec![partition_for(user, config.partitions)],
        None => (0..config.partitions).collect(),
    };

    let mut states: Vec<UserState> = Vec::new();
    for partition in partitions {
        let path = config.partition_store_path(partition);
        if !path.exists() {
            continue;
        }
        let store = PartitionStore::open_existing(&path, partition)?;
        match user {
            Some(user) => states.push(store.user_state(user)?),
            None => {
                for id in store.user_ids()? {
                    states.push(store.user_state(&id)?);
                }
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}

fn cmd_doctor(overrides: ConfigOverrides, json: bool) -> Result<(), CliFailure> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "stride_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Stride version {}", STRIDE_VERSION),
    });

    match overrides.load() {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "{} partitions, window {}s + {}s grace, depth {}, debounce {}s",
                    config.partitions,
                    config.window_size_secs,
                    config.window_grace_secs,
                    config.history_depth,
                    config.debounce_threshold_secs
                ),
            });
            check_state_dir(&config, &mut checks);
        }
        Err(e) => checks.push(DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Error,
            message: CliError::from(e).message,
        }),
    }

    // Check stdin is available (for streaming mode)
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: STRIDE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Stride Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(CliFailure::DoctorFailed)
    } else {
        Ok(())
    }
}

fn check_state_dir(config: &PipelineConfig, checks: &mut Vec<DoctorCheck>) {
    let dir = &config.state_dir;
    if !dir.exists() {
        checks.push(DoctorCheck {
            name: "state_dir".to_string(),
            status: CheckStatus::Warning,
            message: format!("{} does not exist yet; it is created on first run", dir.display()),
        });
        return;
    }

    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => checks.push(DoctorCheck {
            name: "state_dir".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} is a writable directory", dir.display()),
        }),
        Ok(_) => checks.push(DoctorCheck {
            name: "state_dir".to_string(),
            status: CheckStatus::Error,
            message: format!("{} is not a writable directory", dir.display()),
        }),
        Err(e) => checks.push(DoctorCheck {
            name: "state_dir".to_string(),
            status: CheckStatus::Error,
            message: format!("Cannot read {}: {}", dir.display(), e),
        }),
    }

    for partition in 0..config.partitions {
        let path = config.partition_store_path(partition);
        let name = format!("partition_{partition}");
        if !path.exists() {
            checks.push(DoctorCheck {
                name,
                status: CheckStatus::Warning,
                message: "No state database yet".to_string(),
            });
            continue;
        }

        // Opening read-write verifies schema version and partition layout
        let check = match PartitionStore::open(&path, partition, config.partitions)
            .and_then(|store| Ok((store.user_ids()?.len(), store.open_window_count()?)))
        {
            Ok((users, windows)) => DoctorCheck {
                name,
                status: CheckStatus::Ok,
                message: format!(
                    "schema v{}, {} user(s), {} open window(s)",
                    CURRENT_SCHEMA_VERSION, users, windows
                ),
            },
            Err(e) => DoctorCheck {
                name,
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        };
        checks.push(check);
    }
}

// Error types

#[derive(Debug)]
enum CliFailure {
    Io(io::Error),
    Process(ProcessError),
    Config(ConfigError),
    Json(serde_json::Error),
    PartitionsHalted(usize),
    DoctorFailed,
}

impl From<io::Error> for CliFailure {
    fn from(e: io::Error) -> Self {
        CliFailure::Io(e)
    }
}

impl From<ProcessError> for CliFailure {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Config(e) => CliFailure::Config(e),
            other => CliFailure::Process(other),
        }
    }
}

impl From<ConfigError> for CliFailure {
    fn from(e: ConfigError) -> Self {
        CliFailure::Config(e)
    }
}

impl From<serde_json::Error> for CliFailure {
    fn from(e: serde_json::Error) -> Self {
        CliFailure::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<CliFailure> for CliError {
    fn from(e: CliFailure) -> Self {
        match e {
            CliFailure::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            CliFailure::Process(e) => CliError {
                code: "PROCESS_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'stride doctor' to check the state directory".to_string()),
            },
            CliFailure::Config(e) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check STRIDE_* environment variables and flags".to_string()),
            },
            CliFailure::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            CliFailure::PartitionsHalted(count) => CliError {
                code: "PARTITIONS_HALTED".to_string(),
                message: format!("{} partition(s) halted on a fatal error", count),
                hint: Some("See the partition report and logs for the halt reason".to_string()),
            },
            CliFailure::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct RunSummary {
    skipped_lines: usize,
    partitions: Vec<PartitionReport>,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
