use clap::{Parser, Subcommand};
use gleitzeit_core::ErrorKind;
use gleitzeit_engine::EngineError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "gleitzeit")]
#[command(version, about = "Gleitzeit workflow platform CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// State directory for the disk backend (in-memory when absent)
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a workflow document and run it to completion
    Submit(commands::submit::SubmitArgs),

    /// Validate a workflow document without running it
    Validate(commands::validate::ValidateArgs),

    /// Show the status of a workflow
    Status(commands::status::StatusArgs),

    /// Show the persisted results of a workflow
    Results(commands::results::ResultsArgs),

    /// Cancel a workflow
    Cancel(commands::cancel::CancelArgs),

    /// List workflows
    List(commands::list::ListArgs),

    /// Delete a finished workflow's persisted state
    Prune(commands::prune::PruneArgs),

    /// List registered providers
    Providers(commands::providers::ProvidersArgs),
}

/// Exit codes: 0 success, 1 generic failure, 2 validation error,
/// 3 not found, 4 timeout, 5 backpressure.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let kind = err
        .downcast_ref::<EngineError>()
        .map(|e| e.kind())
        .or_else(|| err.downcast_ref::<gleitzeit_core::CoreError>().map(|e| e.kind()));

    match kind {
        Some(ErrorKind::Validation) | Some(ErrorKind::InvalidParameters) => 2,
        Some(ErrorKind::NotFound) => 3,
        Some(ErrorKind::Timeout) => 4,
        Some(ErrorKind::Backpressure) => 5,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gleitzeit={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let storage_dir = cli.storage_dir.clone();
    let result = match cli.command {
        Commands::Submit(args) => commands::submit::execute(args, storage_dir).await,
        Commands::Validate(args) => commands::validate::execute(args).await,
        Commands::Status(args) => commands::status::execute(args, storage_dir).await,
        Commands::Results(args) => commands::results::execute(args, storage_dir).await,
        Commands::Cancel(args) => commands::cancel::execute(args, storage_dir).await,
        Commands::List(args) => commands::list::execute(args, storage_dir).await,
        Commands::Prune(args) => commands::prune::execute(args, storage_dir).await,
        Commands::Providers(args) => commands::providers::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}
