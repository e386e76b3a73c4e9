//! CLI entry point for the delivery ETL.
//!
//! Each subcommand runs the pipeline up to one stage against PostgreSQL, or
//! against an in-memory warehouse with `--dry-run`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use delivery_etl::config::{DEFAULT_SOURCE_PATH, EtlConfig};
use delivery_etl::pipeline::{
    DEFAULT_RETRIES, Pipeline, RetryPolicy, Stage, run_with_retry,
};
use delivery_etl::report::{RunSummary, append_record, log_summary};
use delivery_etl::store::{MemoryWarehouse, PgWarehouse, Warehouse};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "delivery_etl")]
#[command(about = "Loads food-delivery records into a PostgreSQL star schema", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the source CSV into the raw table and read it back
    Extract(RunArgs),
    /// Extract, clean, and prepare an empty star schema
    Transform(RunArgs),
    /// Extract, transform, and populate dimensions and facts
    Load(RunArgs),
    /// The full pipeline with retries
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Re-runs after a failed attempt
        #[arg(long, default_value_t = DEFAULT_RETRIES)]
        retries: u32,

        /// Seconds to wait before each re-run
        #[arg(long, default_value_t = 300)]
        retry_delay_secs: u64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Delivery CSV to extract
    #[arg(short, long, default_value = DEFAULT_SOURCE_PATH)]
    source: PathBuf,

    /// Run against an in-memory warehouse instead of PostgreSQL
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// CSV file to append the run summary to
    #[arg(short, long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/delivery_etl.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("delivery_etl.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let (stage, args, policy) = match cli.command {
        Commands::Extract(args) => (Stage::Extract, args, no_retry()),
        Commands::Transform(args) => (Stage::Transform, args, no_retry()),
        Commands::Load(args) => (Stage::Load, args, no_retry()),
        Commands::Run {
            args,
            retries,
            retry_delay_secs,
        } => (
            Stage::Load,
            args,
            RetryPolicy {
                retries,
                delay: Duration::from_secs(retry_delay_secs),
            },
        ),
    };

    let config = EtlConfig::from_env(&args.source)?;
    info!(
        stage = %stage,
        source = %config.source_path.display(),
        dry_run = args.dry_run,
        "Starting ETL"
    );

    let outcome = if args.dry_run {
        warn!("Dry run: writing to an in-memory warehouse");
        let pipeline = Pipeline::new(config, MemoryWarehouse::new());
        let outcome = execute(&pipeline, stage, &policy).await;
        for (table, rows) in pipeline.store().row_counts().await {
            info!(table, rows, "In-memory table");
        }
        outcome
    } else {
        let store = PgWarehouse::connect_lazy(&config)?;
        let pipeline = Pipeline::new(config, store);
        let outcome = execute(&pipeline, stage, &policy).await;
        pipeline.into_store().close().await;
        outcome
    };

    if let Some(path) = &args.report {
        append_record(path, &outcome)?;
        info!(path = %path.display(), "Run summary appended");
    }

    match outcome.error_message {
        Some(message) => anyhow::bail!("ETL {} failed: {}", stage, message),
        None => Ok(()),
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        retries: 0,
        delay: Duration::ZERO,
    }
}

/// Runs the pipeline and folds a failure into an error summary.
async fn execute<W: Warehouse>(
    pipeline: &Pipeline<W>,
    stage: Stage,
    policy: &RetryPolicy,
) -> RunSummary {
    match run_with_retry(pipeline, stage, policy).await {
        Ok(summary) => {
            log_summary(&summary);
            summary
        }
        Err(e) => RunSummary::from_error(
            stage.as_str(),
            policy.retries + 1,
            e.phase(),
            &e.to_string(),
        ),
    }
}
