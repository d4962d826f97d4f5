//! Stage C: accumulates records into fixed-size batches and uploads them.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tokio_util::sync::CancellationToken;

use crate::{
    catalog::TableDescriptor,
    sink::SinkWriter,
    value::Record,
};

use super::channel::TableChannel;

/// Final per-table tally produced by the drain loop.
#[derive(Debug)]
pub struct DrainResult {
    pub table: Arc<TableDescriptor>,
    pub total_keys: u64,
    pub total_records: u64,
    pub uploaded_records: u64,
    pub failed_records: Vec<Record>,
}

/// Drain one table's records queue to the sink.
///
/// Flushes exactly `record_batch_size` records whenever the buffer fills,
/// flushes partial batches after `batch_timeout` without traffic, and
/// flushes the remainder when the queue closes (Stage B has latched
/// `records_done` by then). Failed batches accumulate in the result; they
/// are never retried. After cancellation no further uploads start; the
/// unflushed buffer counts as failed so the tally stays exact.
pub async fn drain_table(
    sink: &dyn SinkWriter,
    channel: &TableChannel,
    mut records: mpsc::Receiver<Record>,
    record_batch_size: usize,
    batch_timeout: Duration,
    cancel: &CancellationToken,
) -> DrainResult {
    let table = channel.table();
    let mut buf: Vec<Record> = Vec::with_capacity(record_batch_size);
    let mut failed: Vec<Record> = Vec::new();
    let mut uploaded: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if !buf.is_empty() {
                    warn!(
                        table = %table.qualified_name(),
                        buffered = buf.len(),
                        "cancelled_with_buffered_records"
                    );
                    failed.append(&mut buf);
                }
                break;
            }
            next = tokio::time::timeout(batch_timeout, records.recv()) => match next {
                Ok(Some(record)) => {
                    buf.push(record);
                    if buf.len() >= record_batch_size {
                        let batch: Vec<Record> = buf.drain(..record_batch_size).collect();
                        flush(sink, channel, batch, &mut uploaded, &mut failed, cancel).await;
                    }
                }
                Ok(None) => {
                    // Queue closed and drained; records_done holds.
                    debug_assert!(channel.records_done());
                    if !buf.is_empty() {
                        let batch = std::mem::take(&mut buf);
                        flush(sink, channel, batch, &mut uploaded, &mut failed, cancel).await;
                    }
                    break;
                }
                Err(_) => {
                    // Idle: nothing arrived within the batch timeout.
                    if !buf.is_empty() {
                        let batch = std::mem::take(&mut buf);
                        flush(sink, channel, batch, &mut uploaded, &mut failed, cancel).await;
                    }
                }
            }
        }
    }

    let total_keys = channel.keys_read();
    let total_records = channel.records_read();
    info!(
        table = %table.qualified_name(),
        total_keys,
        total_records,
        uploaded,
        failed = failed.len(),
        elapsed = ?channel.elapsed(),
        "migration_table_completed"
    );

    DrainResult {
        table: Arc::new(table.clone()),
        total_keys,
        total_records,
        uploaded_records: uploaded,
        failed_records: failed,
    }
}

async fn flush(
    sink: &dyn SinkWriter,
    channel: &TableChannel,
    batch: Vec<Record>,
    uploaded: &mut u64,
    failed: &mut Vec<Record>,
    cancel: &CancellationToken,
) {
    let table = channel.table();
    let label = Uuid::new_v4().to_string();
    let count = batch.len();

    let payload = match serde_json::to_string(&batch) {
        Ok(payload) => payload,
        Err(e) => {
            error!(
                table = %table.qualified_name(),
                batch = count,
                error = %e,
                "record_serialization_failed"
            );
            failed.extend(batch);
            return;
        }
    };

    info!(
        table = %table.qualified_name(),
        batch = count,
        label = %label,
        total_keys = channel.keys_read(),
        total_records = channel.records_read(),
        elapsed = ?channel.elapsed(),
        "migration_batch_flush"
    );

    match sink.upload(&table.name, payload, &label, cancel).await {
        Ok(()) => *uploaded += count as u64,
        Err(e) if e.is_cancelled() => {
            // Distinct from an upload failure: the batch was in flight
            // when the run was cancelled.
            warn!(
                table = %table.qualified_name(),
                label = %label,
                batch = count,
                "upload_cancelled"
            );
            failed.extend(batch);
        }
        Err(e) => {
            error!(
                table = %table.qualified_name(),
                label = %label,
                batch = count,
                error = %e,
                "stream_load_failed"
            );
            failed.extend(batch);
        }
    }
}
