//! Per-table coordination between the pipeline stages.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::mpsc;

use crate::{
    catalog::TableDescriptor,
    source::KeyRange,
    value::Record,
};

/// Coordination object shared by Stages A and B for one admitted table.
///
/// Holds the bounded ranges queue (capacity `id_batch_size`), the
/// monotonic per-stage counters, and the write-once done latches. The
/// ranges queue is closed when `ids_done` latches, so consumers observe
/// "done and drained" as end-of-stream. The records queue lives outside
/// this struct (see [`TableStream`]) and closes when Stage B drops its
/// senders after latching `records_done`.
#[derive(Debug)]
pub struct TableChannel {
    table: Arc<TableDescriptor>,
    range_tx: async_channel::Sender<KeyRange>,
    range_rx: async_channel::Receiver<KeyRange>,
    total_keys_read: AtomicU64,
    total_records_read: AtomicU64,
    ids_done: AtomicBool,
    records_done: AtomicBool,
    started_at: Instant,
}

impl TableChannel {
    pub fn new(table: Arc<TableDescriptor>, id_batch_size: usize) -> Arc<Self> {
        let (range_tx, range_rx) = async_channel::bounded(id_batch_size.max(1));
        Arc::new(Self {
            table,
            range_tx,
            range_rx,
            total_keys_read: AtomicU64::new(0),
            total_records_read: AtomicU64::new(0),
            ids_done: AtomicBool::new(false),
            records_done: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    /// Enqueue a range, blocking while the queue is full. This is the
    /// primary backpressure point from Stage B into Stage A. Fails only
    /// once the queue is closed.
    pub async fn push_range(&self, range: KeyRange) -> Result<(), RangeQueueClosed> {
        self.range_tx
            .send(range)
            .await
            .map_err(|_| RangeQueueClosed)
    }

    /// Dequeue the next range. Returns `None` once `ids_done` has latched
    /// and the queue is drained.
    pub async fn next_range(&self) -> Option<KeyRange> {
        self.range_rx.recv().await.ok()
    }

    /// Ranges currently queued; exposed for backpressure assertions.
    pub fn pending_ranges(&self) -> usize {
        self.range_rx.len()
    }

    pub fn add_keys_read(&self, count: u64) {
        self.total_keys_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn keys_read(&self) -> u64 {
        self.total_keys_read.load(Ordering::Relaxed)
    }

    pub fn add_records_read(&self, count: u64) {
        self.total_records_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn records_read(&self) -> u64 {
        self.total_records_read.load(Ordering::Relaxed)
    }

    /// Latch `ids_done` and close the ranges queue. Idempotent.
    pub fn mark_ids_done(&self) {
        self.ids_done.store(true, Ordering::Release);
        self.range_tx.close();
    }

    pub fn ids_done(&self) -> bool {
        self.ids_done.load(Ordering::Acquire)
    }

    /// Latch `records_done`. Stage B calls this after its workers have
    /// joined, before dropping the last records sender.
    pub fn mark_records_done(&self) {
        self.records_done.store(true, Ordering::Release);
    }

    pub fn records_done(&self) -> bool {
        self.records_done.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// The ranges queue was closed while a send was pending; the run is
/// shutting down.
#[derive(Debug, thiserror::Error)]
#[error("ranges queue closed")]
pub struct RangeQueueClosed;

/// Drain side of a table handed to Stage C through the multiplexer.
#[derive(Debug)]
pub struct TableStream {
    pub channel: Arc<TableChannel>,
    pub records: mpsc::Receiver<Record>,
}
