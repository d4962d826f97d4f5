//! Table admission and the Stage C drain multiplexer.

use std::{path::Path, sync::Arc};

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tracing::{error, info, warn};

use tokio_util::sync::CancellationToken;

use crate::{
    catalog::TableDescriptor,
    config::WorkerOptions,
    sink::SinkWriter,
    source::SourceReader,
};

use super::{
    RunReport, TableReport,
    channel::{TableChannel, TableStream},
    drainer::{self, DrainResult},
    fetcher, producer,
};

/// Run the whole fleet: admit up to `concurrent_tables` tables into
/// Stage A/B under a semaphore, feed each table's drain side through a
/// bounded multiplexer into Stage C, and collect the per-table tallies.
pub(super) async fn run(
    source: Arc<dyn SourceReader>,
    sink: Arc<dyn SinkWriter>,
    options: WorkerOptions,
    failed_records_dir: &Path,
    tables: Vec<TableDescriptor>,
    cancel: CancellationToken,
) -> RunReport {
    let started = std::time::Instant::now();

    let (feed_tx, mut feed_rx) = mpsc::channel::<TableStream>(options.concurrent_tables.max(1));
    let semaphore = Arc::new(Semaphore::new(options.concurrent_tables.max(1)));

    let admission = {
        let source = Arc::clone(&source);
        let options = options.clone();
        let cancel = cancel.clone();
        async move {
            let mut stages: JoinSet<()> = JoinSet::new();

            for table in tables {
                if cancel.is_cancelled() {
                    break;
                }
                if table.primary_keys.is_empty() {
                    warn!(
                        table = %table.qualified_name(),
                        "table_has_no_primary_key"
                    );
                    continue;
                }

                let table = Arc::new(table);
                let channel = TableChannel::new(Arc::clone(&table), options.id_batch_size);
                let (record_tx, record_rx) = mpsc::channel(options.worker_batch_size.max(1));

                // Hand the drain side to Stage C first; the feed is the
                // bounded multiplexer, so this blocks when Stage C is
                // saturated.
                let stream = TableStream {
                    channel: Arc::clone(&channel),
                    records: record_rx,
                };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = feed_tx.send(stream) => res.is_ok(),
                };
                if !sent {
                    break;
                }

                // Admission: one semaphore slot per running table pipeline,
                // held until Stage B latches records_done.
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                info!(table = %table.qualified_name(), "table_admitted");

                let source = Arc::clone(&source);
                let options = options.clone();
                let cancel = cancel.clone();
                stages.spawn(async move {
                    let _permit = permit;
                    tokio::join!(
                        producer::run(
                            source.as_ref(),
                            &channel,
                            options.id_batch_size,
                            options.worker_batch_size,
                            &cancel,
                        ),
                        fetcher::run(
                            Arc::clone(&source),
                            Arc::clone(&channel),
                            record_tx,
                            options.no_of_workers,
                            cancel.clone(),
                        ),
                    );
                });
            }

            while let Some(joined) = stages.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "table_pipeline_panicked");
                }
            }
            // All tables admitted and finished; dropping the sender closes
            // the multiplexer.
            drop(feed_tx);
        }
    };

    let drain = {
        let sink = Arc::clone(&sink);
        let options = options.clone();
        let cancel = cancel.clone();
        async move {
            let mut drains: JoinSet<DrainResult> = JoinSet::new();

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = feed_rx.recv() => match next {
                        Some(stream) => {
                            let sink = Arc::clone(&sink);
                            let options = options.clone();
                            let cancel = cancel.clone();
                            drains.spawn(async move {
                                drainer::drain_table(
                                    sink.as_ref(),
                                    &stream.channel,
                                    stream.records,
                                    options.record_batch_size,
                                    options.batch_processing_timeout,
                                    &cancel,
                                )
                                .await
                            });
                        }
                        None => break,
                    },
                }
            }

            let mut results = Vec::new();
            while let Some(joined) = drains.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => error!(error = %e, "drain_task_panicked"),
                }
            }
            results
        }
    };

    let ((), results) = tokio::join!(admission, drain);

    let mut reports = Vec::with_capacity(results.len());
    for result in results {
        if !result.failed_records.is_empty() {
            write_failed_records(failed_records_dir, &result);
        }
        reports.push(TableReport {
            schema: result.table.schema.clone(),
            name: result.table.name.clone(),
            total_keys: result.total_keys,
            total_records: result.total_records,
            uploaded_records: result.uploaded_records,
            failed_records: result.failed_records.len() as u64,
        });
    }

    RunReport {
        tables: reports,
        elapsed: started.elapsed(),
    }
}

fn write_failed_records(dir: &Path, result: &DrainResult) {
    let path = dir.join(format!("{}_failed_records.json", result.table.name));
    info!(
        table = %result.table.qualified_name(),
        failed = result.failed_records.len(),
        path = %path.display(),
        "saving_failed_records"
    );

    let payload = match serde_json::to_vec_pretty(&result.failed_records) {
        Ok(payload) => payload,
        Err(e) => {
            error!(
                table = %result.table.qualified_name(),
                error = %e,
                "failed_records_serialization_failed"
            );
            return;
        }
    };

    if let Err(e) = std::fs::write(&path, payload) {
        error!(
            table = %result.table.qualified_name(),
            path = %path.display(),
            error = %e,
            "failed_records_write_failed"
        );
    }
}
