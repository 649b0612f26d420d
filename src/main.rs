use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use revpay::application::processor::PaymentProcessor;
use revpay::config::ProcessorConfig;
use revpay::domain::ports::Stores;
use revpay::interfaces::csv::request_reader::RequestReader;
use revpay::interfaces::csv::transaction_writer::TransactionWriter;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input payment requests CSV file
    input: PathBuf,

    /// Processor configuration (JSON). Defaults to the built-in sandbox gateways.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use revpay::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => Ok(Stores::from_backend(
            RocksDBStore::open(path).into_diagnostic()?,
        )),
        None => Ok(Stores::in_memory()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        tracing::warn!("Built without storage-rocksdb; --db-path ignored, using memory");
    }
    Ok(Stores::in_memory())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ProcessorConfig::load(path).into_diagnostic()?,
        None => ProcessorConfig::sandbox(),
    };
    let stores = open_stores(cli.db_path)?;
    let processor = PaymentProcessor::new(config, stores).into_diagnostic()?;

    let file = File::open(cli.input).into_diagnostic()?;
    let reader = RequestReader::new(file);
    for (row, request) in reader.requests().enumerate() {
        match request {
            Ok(payment) => {
                if let Err(e) = processor.create_transaction(payment, Utc::now()).await {
                    eprintln!("Error processing request {}: {}", row + 1, e);
                }
            }
            Err(e) => {
                eprintln!("Error reading request {}: {}", row + 1, e);
            }
        }
    }

    let transactions = processor.transactions().await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = TransactionWriter::new(stdout.lock());
    writer.write_transactions(&transactions).into_diagnostic()?;

    Ok(())
}
