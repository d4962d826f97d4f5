//! Stage B: a worker pool turning key ranges into records.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info, warn};

use tokio_util::sync::CancellationToken;

use crate::{
    logging,
    source::SourceReader,
    value::Record,
};

use super::channel::TableChannel;

/// Run `no_of_workers` workers over the table's ranges queue.
///
/// Each worker fetches a range's records and forwards them into the
/// records queue, which backpressures when full. A failed range is logged
/// and dropped; the shortfall stays visible as the gap between
/// `total_keys_read` and `total_records_read`. Once the queue is
/// exhausted and every worker has joined, `records_done` latches and the
/// records queue closes.
pub async fn run(
    source: Arc<dyn SourceReader>,
    channel: Arc<TableChannel>,
    record_tx: mpsc::Sender<Record>,
    no_of_workers: usize,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();
    for _ in 0..no_of_workers.max(1) {
        let source = Arc::clone(&source);
        let channel = Arc::clone(&channel);
        let record_tx = record_tx.clone();
        let cancel = cancel.clone();
        workers.spawn(async move {
            worker_loop(source.as_ref(), &channel, &record_tx, &cancel).await;
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(
                table = %channel.table().qualified_name(),
                error = %e,
                "range_worker_panicked"
            );
        }
    }

    let keys_read = channel.keys_read();
    let records_read = channel.records_read();
    if keys_read != records_read && !cancel.is_cancelled() {
        // Dropped ranges are not re-enqueued; the run report carries the gap.
        warn!(
            table = %channel.table().qualified_name(),
            total_keys = keys_read,
            total_records = records_read,
            "record_shortfall_detected"
        );
    }

    // Latch before the last sender drops so Stage C always observes
    // `records_done` once the queue reports end-of-stream.
    channel.mark_records_done();
    drop(record_tx);

    info!(
        table = %channel.table().qualified_name(),
        total_keys = keys_read,
        total_records = records_read,
        "finished_reading_records"
    );
}

async fn worker_loop(
    source: &dyn SourceReader,
    channel: &TableChannel,
    record_tx: &mpsc::Sender<Record>,
    cancel: &CancellationToken,
) {
    loop {
        let range = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = channel.next_range() => match next {
                Some(range) => range,
                None => return,
            },
        };

        match source
            .fetch_records_range(channel.table(), &range, cancel)
            .await
        {
            Ok(records) => {
                let count = records.len() as u64;
                for record in records {
                    let delivered = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        sent = record_tx.send(record) => sent.is_ok(),
                    };
                    if !delivered {
                        return;
                    }
                }
                channel.add_records_read(count);
            }
            Err(e) if e.is_cancelled() => {
                debug!(
                    table = %channel.table().qualified_name(),
                    "range_fetch_cancelled"
                );
                return;
            }
            Err(e) => {
                error!(
                    table = %channel.table().qualified_name(),
                    error = %e,
                    error_source = logging::error_source(&e),
                    "range_fetch_failed"
                );
            }
        }
    }
}
