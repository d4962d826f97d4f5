//! Stage A: walks the primary key space and emits work ranges.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    source::{KeyRange, SourceError, SourceReader},
    value::KeyTuple,
};

use super::channel::TableChannel;

/// Scan the table's key space in pages of `id_batch_size`, slicing each
/// page into inclusive ranges of at most `worker_batch_size` keys for
/// Stage B.
///
/// Emission blocks while the ranges queue is full. On return (normal
/// exhaustion, a page fetch failure, or cancellation) `ids_done` is
/// latched and the queue closed so Stage B can drain what is left.
pub async fn run(
    source: &dyn SourceReader,
    channel: &TableChannel,
    id_batch_size: usize,
    worker_batch_size: usize,
    cancel: &CancellationToken,
) {
    let result = if channel.table().primary_keys.len() > 1 {
        produce_composite(source, channel, id_batch_size, worker_batch_size, cancel).await
    } else {
        produce_single(source, channel, id_batch_size, worker_batch_size, cancel).await
    };

    channel.mark_ids_done();

    match result {
        Ok(()) => debug!(
            table = %channel.table().qualified_name(),
            total_keys = channel.keys_read(),
            "finished_reading_keys"
        ),
        Err(e) if e.is_cancelled() => debug!(
            table = %channel.table().qualified_name(),
            "key_scan_cancelled"
        ),
        Err(e) => error!(
            table = %channel.table().qualified_name(),
            error = %e,
            "key_page_fetch_failed"
        ),
    }
}

async fn produce_single(
    source: &dyn SourceReader,
    channel: &TableChannel,
    id_batch_size: usize,
    worker_batch_size: usize,
    cancel: &CancellationToken,
) -> Result<(), SourceError> {
    let table = channel.table();
    let pk = &table.primary_keys[0];

    let Some(mut cursor) = source.first_key_single(table, pk, cancel).await? else {
        debug!(table = %table.qualified_name(), "table_empty");
        return Ok(());
    };

    // The first page must include the very first key; every page after
    // that is exclusive so the cursor row is not re-emitted.
    let mut inclusive = true;
    loop {
        let page = source
            .fetch_key_page_single(table, pk, &cursor, inclusive, id_batch_size, cancel)
            .await?;
        inclusive = false;

        if page.is_empty() {
            return Ok(());
        }

        for chunk in page.chunks(worker_batch_size) {
            let range = KeyRange::Single {
                lo: chunk[0].clone(),
                hi: chunk[chunk.len() - 1].clone(),
            };
            emit(channel, range, cancel).await?;
        }

        channel.add_keys_read(page.len() as u64);
        cursor = page[page.len() - 1].clone();
    }
}

async fn produce_composite(
    source: &dyn SourceReader,
    channel: &TableChannel,
    id_batch_size: usize,
    worker_batch_size: usize,
    cancel: &CancellationToken,
) -> Result<(), SourceError> {
    let table = channel.table();

    let Some(mut cursor) = source.first_key_composite(table, cancel).await? else {
        debug!(table = %table.qualified_name(), "table_empty");
        return Ok(());
    };

    let mut inclusive = true;
    loop {
        let page: Vec<KeyTuple> = source
            .fetch_key_page_composite(table, &cursor, inclusive, id_batch_size, cancel)
            .await?;
        inclusive = false;

        if page.is_empty() {
            return Ok(());
        }

        for chunk in page.chunks(worker_batch_size) {
            let range = KeyRange::Composite {
                lo: chunk[0].clone(),
                hi: chunk[chunk.len() - 1].clone(),
            };
            emit(channel, range, cancel).await?;
        }

        channel.add_keys_read(page.len() as u64);
        cursor = page[page.len() - 1].clone();
    }
}

async fn emit(
    channel: &TableChannel,
    range: KeyRange,
    cancel: &CancellationToken,
) -> Result<(), SourceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SourceError::Cancelled),
        res = channel.push_range(range) => res.map_err(|_| SourceError::Cancelled),
    }
}
