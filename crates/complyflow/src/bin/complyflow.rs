use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;

use complyflow::error::WorkerError;
use complyflow::worker::WorkerReport;
use complyflow::{load_config, telemetry, Pipeline, PollOutcome, Stage};

type CliResult = Result<(), Box<dyn std::error::Error>>;

const DEAD_LETTER_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "complyflow")]
#[command(about = "Turns regulatory documents into obligations, audit tasks and compliance reports")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.complyflow/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stage worker pools until interrupted
    Run,

    /// Process queued messages on this thread until every queue is empty
    Drain {
        /// Give up after this many seconds
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// Register a document and start its first generation
    Submit {
        document_id: String,
        /// Object store key of the source document
        source_key: String,
        #[arg(long)]
        owner: String,
        /// Upload this local file to `source_key` first
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Start a new generation for a completed or failed document
    Resubmit { document_id: String },

    /// Print a document's stage and ledger entries as JSON
    Status { document_id: String },

    /// Inspect and recover dead-lettered messages
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Compile another report for a completed document
    RegenerateReport {
        document_id: String,
        /// Repeating a request id returns the same report
        request_id: String,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead letters, optionally for one stage
    List {
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Counts by stage and state
    Stats,
    /// Put a dead letter back on its queue
    Redrive { id: i64 },
    /// Drop a dead letter
    Discard { id: i64 },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".complyflow")
        .join("config.json")
}

fn run(cli: Cli) -> CliResult {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;

    if let Err(e) = telemetry::init_logging(&config.logging) {
        eprintln!("warning: {}", e);
    }
    info!("complyflow v{} using {}", env!("CARGO_PKG_VERSION"), config_path.display());

    let pipeline = Pipeline::from_config(config)?;

    match cli.command {
        Commands::Run => cmd_run(&pipeline),
        Commands::Drain { timeout_secs } => {
            let report = pipeline.drain(Duration::from_secs(timeout_secs))?;
            print_json(&report)
        }
        Commands::Submit {
            document_id,
            source_key,
            owner,
            file,
        } => {
            if let Some(path) = file {
                let bytes = std::fs::read(&path)?;
                pipeline.store().put(&source_key, &bytes)?;
                info!("Uploaded {} to {}", path.display(), source_key);
            }
            let generation_id = pipeline.coordinator().submit(&document_id, &source_key, &owner)?;
            println!("{}", generation_id);
            Ok(())
        }
        Commands::Resubmit { document_id } => {
            let generation_id = pipeline.coordinator().resubmit(&document_id)?;
            println!("{}", generation_id);
            Ok(())
        }
        Commands::Status { document_id } => print_json(&pipeline.coordinator().status(&document_id)?),
        Commands::DeadLetters { action } => cmd_dead_letters(&pipeline, action),
        Commands::RegenerateReport {
            document_id,
            request_id,
        } => print_json(&pipeline.reporter().regenerate(&document_id, &request_id)?),
    }
}

fn cmd_run(pipeline: &Pipeline) -> CliResult {
    let pool = pipeline.start_workers()?;

    let shutdown = pool.shutdown_flag();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
        .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;
    info!("{} worker thread(s) running; press Ctrl-C to stop", pool.thread_count());

    let mut last_scan = Instant::now();
    while !pool.is_shutdown() {
        match pool.recv_report_timeout(Duration::from_secs(1)) {
            Ok(Some(report)) => log_report(&report),
            Ok(None) => {}
            Err(e) => {
                error!("{}", e);
                break;
            }
        }
        if last_scan.elapsed() >= DEAD_LETTER_SCAN_INTERVAL {
            if let Err(e) = pipeline.dead_letters().announce_new() {
                warn!("Dead-letter scan failed: {}", e);
            }
            last_scan = Instant::now();
        }
    }

    pool.wait();
    Ok(())
}

fn log_report(report: &WorkerReport) {
    let target = format!("{} {}/{}", report.stage, report.document_id, report.generation_id);
    match &report.outcome {
        PollOutcome::Completed(advance) => info!("[{}] {} completed: {:?}", report.group, target, advance),
        PollOutcome::Failed { class, error } => {
            warn!("[{}] {} failed ({}): {}", report.group, target, class, error)
        }
        PollOutcome::CoordinatorFault(e) => error!("[{}] {} coordinator fault: {}", report.group, target, e),
        other => log::debug!("[{}] {}: {:?}", report.group, target, other),
    }
}

fn cmd_dead_letters(pipeline: &Pipeline, action: DeadLetterAction) -> CliResult {
    let handler = pipeline.dead_letters();
    match action {
        DeadLetterAction::List { stage } => print_json(&handler.list(stage)?),
        DeadLetterAction::Stats => print_json(&handler.statistics()?),
        DeadLetterAction::Redrive { id } => print_json(&handler.redrive(id)?),
        DeadLetterAction::Discard { id } => {
            if handler.discard(id)? {
                println!("discarded {}; its document generation was marked failed", id);
            } else {
                println!("discarded {}", id);
            }
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
