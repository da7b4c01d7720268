/*!
 * Partwise CLI - resumable multipart transfers against a local object store
 */

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use partwise::{
    config::{CheckpointConfig, LogConfig, LogLevel, TransferConfig},
    core::checkpoint::Checkpoint,
    error::{TransferError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    stats::format_bytes,
    LocalObjectStore, ProgressEvent, ProgressPublisher, TransferManager, TransferStats,
};
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Parser)]
#[command(name = "partwise")]
#[command(version, about = "Resumable, concurrent multipart transfers", long_about = None)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Root directory of the object store
    #[arg(long, value_name = "DIR", default_value = "partwise-store", global = true)]
    store: PathBuf,

    /// Part size, e.g. 8M or 1048576
    #[arg(
        long,
        value_name = "SIZE",
        value_parser = parse_size,
        global = true,
        conflicts_with = "parts"
    )]
    part_size: Option<u64>,

    /// Fixed number of parts
    #[arg(long, value_name = "N", global = true)]
    parts: Option<u32>,

    /// Concurrent part workers
    #[arg(long, value_name = "N", global = true)]
    routines: Option<usize>,

    /// Persist progress so an interrupted transfer can resume
    #[arg(short = 'r', long, global = true)]
    resume: bool,

    /// Directory for checkpoint files (implies --resume)
    #[arg(long, value_name = "DIR", global = true)]
    checkpoint_dir: Option<PathBuf>,

    /// Exact checkpoint file (implies --resume)
    #[arg(long, value_name = "FILE", global = true)]
    checkpoint_file: Option<PathBuf>,

    /// Bandwidth cap, e.g. 10M per second (0 = unlimited)
    #[arg(long, value_name = "RATE", value_parser = parse_size, global = true)]
    max_bandwidth: Option<u64>,

    /// Skip the end-to-end CRC-64 comparison
    #[arg(long, global = true)]
    no_verify: bool,

    /// Include a content hash of local sources in the resume identity
    #[arg(long, global = true)]
    hash_source: bool,

    /// Show progress bar
    #[arg(long = "show-progress", global = true)]
    show_progress: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevelArg,

    /// Write JSON logs to this file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file to an object key
    Upload { file: PathBuf, key: String },

    /// Download an object key to a local file
    Download { key: String, file: PathBuf },

    /// Copy one object to another inside the store
    Copy { source: String, destination: String },

    /// Show the state recorded in a checkpoint file
    Inspect { checkpoint: PathBuf },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

/// Parse a byte count with an optional K/M/G suffix (powers of 1024)
fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1024,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                _ => return Err(format!("unknown size suffix '{}'", c)),
            };
            (&value[..i], multiplier)
        }
        _ => (value, 1),
    };
    let base: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TransferError>()
                .map(TransferError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.log_level.into(),
        file: cli.log.clone(),
        verbose: cli.verbose,
    };
    if let Err(e) = logging::init_logging(&log_config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Inspect { ref checkpoint } => inspect(checkpoint),
        Commands::Upload { ref file, ref key } => transfer(&cli, |m| m.upload(file, key)),
        Commands::Download { ref key, ref file } => transfer(&cli, |m| m.download(key, file)),
        Commands::Copy {
            ref source,
            ref destination,
        } => transfer(&cli, |m| m.copy(source, destination)),
    }
}

/// Run one transfer against the store, with an optional progress bar
fn transfer<F>(cli: &Cli, operation: F) -> anyhow::Result<()>
where
    F: FnOnce(&TransferManager<LocalObjectStore>) -> partwise::Result<TransferStats>,
{
    let config = build_config(cli)?;
    let store = LocalObjectStore::open(&cli.store)
        .with_context(|| format!("opening store at {}", cli.store.display()))?;

    let (progress, bar_thread) = if cli.show_progress {
        let (publisher, events) = ProgressPublisher::unbounded();
        (publisher, Some(thread::spawn(move || render_progress(events))))
    } else {
        (ProgressPublisher::noop(), None)
    };

    let manager = TransferManager::new(store, config)?.with_progress(progress);
    let result = operation(&manager);

    // Closing the channel ends the renderer
    drop(manager);
    if let Some(handle) = bar_thread {
        let _ = handle.join();
    }

    let stats = result?;
    print!("{}", stats);
    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<TransferConfig> {
    let mut config = match cli.config {
        Some(ref path) => TransferConfig::from_file(path)?,
        None => TransferConfig::default(),
    };

    if let Some(size) = cli.part_size {
        config = config.with_part_size(size);
    }
    if let Some(count) = cli.parts {
        config = config.with_part_count(count);
    }
    if let Some(routines) = cli.routines {
        config = config.with_routines(routines);
    }
    if let Some(rate) = cli.max_bandwidth {
        config = config.with_max_bandwidth(rate);
    }
    if let Some(ref path) = cli.checkpoint_file {
        config = config.with_checkpoint(CheckpointConfig::at(path));
    } else if let Some(ref dir) = cli.checkpoint_dir {
        config = config.with_checkpoint(CheckpointConfig::in_dir(dir));
    } else if cli.resume {
        config.checkpoint.enabled = true;
    }
    if cli.no_verify {
        config.verify_checksum = false;
    }
    if cli.hash_source {
        config.hash_source_content = true;
    }

    config.validate()?;
    Ok(config)
}

fn render_progress(events: crossbeam_channel::Receiver<ProgressEvent>) {
    let mut bar: Option<ProgressBar> = None;
    for event in events {
        match event {
            ProgressEvent::TransferStarted {
                kind,
                source,
                total_bytes,
                resumed_parts,
                ..
            } => {
                let new_bar = ProgressBar::new(total_bytes);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                ) {
                    new_bar.set_style(style.progress_chars("#>-"));
                }
                let mut message = format!("{} {}", kind, source);
                if resumed_parts > 0 {
                    message.push_str(&format!(" (resuming, {} parts done)", resumed_parts));
                }
                new_bar.set_message(message);
                bar = Some(new_bar);
            }
            ProgressEvent::PartCompleted { consumed_bytes, .. } => {
                if let Some(ref bar) = bar {
                    bar.set_position(consumed_bytes);
                }
            }
            ProgressEvent::PartFailed {
                part_number, error, ..
            } => {
                if let Some(ref bar) = bar {
                    bar.println(format!("part {} failed: {}", part_number, error));
                }
            }
            ProgressEvent::TransferCompleted { .. } => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
            }
            ProgressEvent::TransferFailed { .. } => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
            }
        }
    }
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    let Some(checkpoint) = Checkpoint::load(path) else {
        bail!("{} is not a valid checkpoint", path.display());
    };

    println!("Checkpoint:  {}", path.display());
    println!("Kind:        {}", checkpoint.kind);
    println!("Source:      {}", checkpoint.source);
    println!("Destination: {}", checkpoint.destination);
    if let Some(ref session_id) = checkpoint.session_id {
        println!("Session:     {}", session_id);
    }
    println!(
        "Progress:    {}/{} parts, {} of {}",
        checkpoint.done_count(),
        checkpoint.parts.len(),
        format_bytes(checkpoint.completed_bytes()),
        format_bytes(checkpoint.identity.size())
    );
    println!("Updated:     {}", checkpoint.updated_at.to_rfc3339());

    let pending: Vec<String> = checkpoint
        .parts
        .iter()
        .filter(|p| !checkpoint.is_done(p.number))
        .map(|p| p.number.to_string())
        .collect();
    if !pending.is_empty() {
        println!("Pending:     {}", pending.join(", "));
    }
    Ok(())
}
