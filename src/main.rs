use std::{path::PathBuf, sync::Arc, time::Instant};

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use tokio_util::sync::CancellationToken;

use dorisync::{
    DorisSinkWriter, Pipeline, PostgresSourceReader,
    catalog::{self, TableFilter},
    config::{self, Destination, Source},
    conn::DbConnPool,
    logging, stats,
};

/// Bulk table migration from PostgreSQL into Apache Doris.
#[derive(Debug, Parser)]
#[command(name = "dorisync", version)]
struct Args {
    /// Path of the config json
    #[arg(long = "config_path", default_value = "config/config.json")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    match runner().await {
        Ok(()) => {}
        Err(e) => {
            // Manually print the error so we can control the format.
            eprintln!("Exiting with error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn runner() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();
    let started = Instant::now();

    info!(config_path = %args.config_path.display(), "loading_configuration");
    let config = config::load(&args.config_path)?;
    let options = config.worker_configuration.resolve()?;
    info!(
        workers = options.no_of_workers,
        worker_batch_size = options.worker_batch_size,
        id_batch_size = options.id_batch_size,
        record_batch_size = options.record_batch_size,
        concurrent_tables = options.concurrent_tables,
        batch_timeout_ms = options.batch_processing_timeout.as_millis() as u64,
        "migration_runner_initialized"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let stats_handle = stats::spawn(&config.stats_configuration, cancel.child_token());

    let Source::Postgres(pg) = &config.source;
    let pool = DbConnPool::connect(&pg.connection_details, options.no_of_workers).await?;
    info!(
        host = %pg.connection_details.host,
        database = %pg.connection_details.database,
        max_conns = options.no_of_workers,
        "source_pool_connected"
    );

    let tables = catalog::list_tables(&pool, &pg.configuration.schemas).await?;
    let filter = TableFilter::from_config(&pg.configuration)?;
    let tables = filter.apply(tables);
    info!(tables = tables.len(), "tables_discovered");

    let Destination::Doris(doris) = &config.destination;
    let sink = DorisSinkWriter::new(&doris.connection_details)?;
    let source = PostgresSourceReader::new(&pool);

    let pipeline = Pipeline::new(Arc::new(source), Arc::new(sink), options);
    let report = pipeline.run(tables, cancel.clone()).await;

    // Stop the stats sampler now that the run is over.
    cancel.cancel();
    if let Some(handle) = stats_handle {
        let _ = handle.await;
    }

    if report.total_failed() > 0 {
        warn!(
            failed_records = report.total_failed(),
            "migration_completed_with_failures"
        );
    }
    info!(
        tables = report.tables.len(),
        elapsed = ?started.elapsed(),
        "migration_completed"
    );
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown_signal_received"),
            _ = sigint.recv() => info!(signal = "SIGINT", "shutdown_signal_received"),
        }
        cancel.cancel();
    });
    Ok(())
}
