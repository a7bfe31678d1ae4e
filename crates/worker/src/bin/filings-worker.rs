//! filings-worker: pulls entity ids off the work queue and keeps each
//! entity's filing archive in the object store complete.
//!
//! Per message: lease → mirror → repair → fetch missing filings → manifest →
//! upload → discard → release → ack.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use vault_core::config::{load_dotenv, Config};
use vault_ingest::{FilingFetcher, FilingsCatalog, HttpDocumentSource, RetryPolicy};
use vault_queue::{QueueConsumer, SqsConsumer};
use vault_storage::{ArchiveStore, LeaseManager, StorageBackend};
use vault_worker::{EntitySync, PollOutcome, PollSettings, SyncOptions, Worker};

// ── CLI ─────────────────────────────────────────────────────────────

/// Queue-driven SEC filing collector.
#[derive(Parser, Debug)]
#[command(name = "filings-worker", version, about)]
struct Cli {
    /// Filings catalog (parquet or jsonl). Overrides CATALOG_PATH.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Local scratch directory. Overrides SCRATCH_DIR.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Re-download filings that are already archived.
    #[arg(long)]
    force_refetch: bool,

    /// Process a single batch and exit.
    #[arg(long)]
    once: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(catalog) = cli.catalog {
        config.catalog.path = catalog;
    }
    if let Some(scratch_dir) = cli.scratch_dir {
        config.storage.scratch_dir = scratch_dir;
    }
    config.fetch.force_refetch |= cli.force_refetch;
    config.validate()?;
    config.log_summary();

    let catalog = Arc::new(FilingsCatalog::load(&config.catalog)?);

    let backend = StorageBackend::from_config(&config)?;
    let store = ArchiveStore::from_backend(&backend, &config.storage.scratch_dir);
    let leases = LeaseManager::new(backend.store_arc(), backend.prefix(), config.lease.ttl());
    info!(owner = %leases.owner(), remote = backend.is_remote(), "Archive store ready");

    let source = Arc::new(HttpDocumentSource::new(&config.fetch)?);
    let fetcher = FilingFetcher::new(source, RetryPolicy::from_config(&config.fetch), store.downloads_dir());

    let queue: Arc<dyn QueueConsumer> = Arc::new(SqsConsumer::new(&config.aws, &config.queue).await?);
    match queue.health_check().await {
        Ok(health) => info!(%health, "Queue reachable"),
        Err(e) => warn!(error = %e, "Queue health check failed, polling anyway"),
    }
    if let Ok(Some(depth)) = queue.dlq_depth().await {
        info!(dead_letter_depth = depth, "Dead-letter queue");
    }

    let sync = EntitySync::new(
        catalog,
        store,
        fetcher,
        leases,
        queue.clone(),
        SyncOptions::from_config(&config.fetch),
    );
    let worker = Worker::new(sync, queue, PollSettings::from_config(&config.queue));

    if cli.once {
        match worker.poll_once().await {
            PollOutcome::Idle => info!("Queue empty"),
            PollOutcome::PollFailed => anyhow::bail!("queue poll failed"),
            PollOutcome::Processed { reports, rejected } => {
                info!(cycles = reports.len(), rejected, "Batch done");
            }
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing current entity");
            let _ = shutdown_tx.send(true);
        }
    });

    info!("filings-worker starting");
    worker.run(shutdown_rx).await;
    info!("filings-worker exited cleanly");
    Ok(())
}
