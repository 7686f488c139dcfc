use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use payretry::application::engine::PaymentRetryEngine;
use payretry::application::simulation::Simulation;
use payretry::config::RetryConfig;
use payretry::domain::ports::TransactionStoreHandle;
use payretry::domain::retry_policy::RetryStrategy;
use payretry::infrastructure::clock::ManualClock;
use payretry::infrastructure::in_memory::InMemoryTransactionStore;
use payretry::infrastructure::notifier::ChannelNotifier;
use payretry::infrastructure::simulated_gateway::SimulatedGateway;
use payretry::interfaces::csv::request_reader::PaymentRequestReader;
use payretry::interfaces::csv::transaction_writer::TransactionWriter;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input payment requests CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Seed for the simulated gateway, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Probability that a simulated gateway attempt succeeds
    #[arg(long, default_value_t = 0.7)]
    success_rate: f64,

    /// Error code the simulated gateway may fail with (repeatable)
    #[arg(long = "failure-code")]
    failure_codes: Vec<String>,

    /// Stop after this many scheduler passes even if work remains
    #[arg(long, default_value_t = 1000)]
    max_passes: usize,

    /// Scheduler poll period; also the virtual time advanced per pass
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Default retry budget for requests that allow retries
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Default base backoff interval
    #[arg(long)]
    base_interval_secs: Option<u64>,

    /// Default backoff strategy
    #[arg(long)]
    strategy: Option<RetryStrategy>,
}

impl Cli {
    fn config(&self) -> payretry::error::Result<RetryConfig> {
        let mut config = RetryConfig::from_env()?;
        if let Some(secs) = self.poll_interval_secs {
            config.poll_period = Duration::from_secs(secs);
        }
        if let Some(max_attempts) = self.max_attempts {
            config.default_max_attempts = max_attempts;
        }
        if let Some(secs) = self.base_interval_secs {
            config.default_base_interval = Duration::from_secs(secs);
        }
        if let Some(strategy) = self.strategy {
            config.default_strategy = strategy;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<&Path>) -> Result<TransactionStoreHandle> {
    use payretry::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => Ok(Arc::new(RocksDBStore::open(path).into_diagnostic()?)),
        None => Ok(Arc::new(InMemoryTransactionStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<&Path>) -> Result<TransactionStoreHandle> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryTransactionStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config().into_diagnostic()?;
    let store = open_store(cli.db_path.as_deref())?;

    let clock = ManualClock::new(Utc::now());
    let (callback_tx, callback_rx) = mpsc::unbounded_channel();
    let mut gateway = SimulatedGateway::new(callback_tx, Arc::new(clock.clone()), cli.seed)
        .with_success_rate(cli.success_rate)
        .into_diagnostic()?;
    if !cli.failure_codes.is_empty() {
        gateway = gateway
            .with_failure_codes(cli.failure_codes.clone())
            .into_diagnostic()?;
    }

    let (notifier, notification_rx) = ChannelNotifier::channel();
    let engine = PaymentRetryEngine::new(
        store,
        Arc::new(gateway),
        Arc::new(notifier),
        Arc::new(clock.clone()),
        config,
    )
    .into_diagnostic()?;

    // Create and initiate every request
    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = PaymentRequestReader::new(file);
    for request in reader.requests() {
        match request {
            Ok(request) => {
                if let Err(e) = engine.submit(request).await {
                    eprintln!("Error submitting payment: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading payment request: {}", e);
            }
        }
    }

    // Let the scheduler work through retries on virtual time
    let report = Simulation::new(&engine, clock, callback_rx, notification_rx, cli.max_passes)
        .into_diagnostic()?
        .run()
        .await
        .into_diagnostic()?;
    if !report.settled {
        warn!(passes = report.passes, "pass limit reached with retries still open");
    }

    let summaries = engine.summaries().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = TransactionWriter::new(stdout.lock());
    writer.write_summaries(&summaries).into_diagnostic()?;

    Ok(())
}
