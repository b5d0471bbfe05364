//! Fire-and-forget audit emission.
//!
//! [`ChannelAuditSink::submit`] never blocks: records go into a bounded channel drained
//! by an [`AuditWriter`] on a blocking thread. A full or closed channel drops the record.

use event_log::{BidAuditRecord, JsonlEventLog};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{info_span, warn};

/// Largest batch written with one open/flush.
const MAX_BATCH: usize = 64;

pub trait AuditSink: Send + Sync {
    fn submit(&self, record: BidAuditRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn submit(&self, _record: BidAuditRecord) {}
}

/// Keeps records in memory; for tests and the CLI's dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<BidAuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<BidAuditRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn submit(&self, record: BidAuditRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }
}

#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<BidAuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl ChannelAuditSink {
    /// Records discarded because the channel was full or the writer had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn submit(&self, record: BidAuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let (reason, rec) = match e {
                TrySendError::Full(r) => ("full", r),
                TrySendError::Closed(r) => ("closed", r),
            };
            warn!(trace_id = %rec.trace_id, reason, "audit record dropped");
        }
    }
}

/// Background task appending audit records to a JSONL log.
#[derive(Debug)]
pub struct AuditWriter {
    handle: JoinHandle<u64>,
}

impl AuditWriter {
    /// Spawn the writer. Must be called inside a tokio runtime. Record ids continue after
    /// the highest id already in `log`.
    pub fn spawn(log: JsonlEventLog, capacity: usize) -> (ChannelAuditSink, Self) {
        let (tx, mut rx) = mpsc::channel::<BidAuditRecord>(capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || {
            let mut next_id = match log.last_id() {
                Ok(last) => last.map_or(1, |id| id + 1),
                Err(e) => {
                    warn!(error = %e, path = %log.path().display(), "could not read last audit id");
                    1
                }
            };
            let mut written = 0u64;
            let mut batch = Vec::with_capacity(MAX_BATCH);
            while let Some(first) = rx.blocking_recv() {
                batch.push(first);
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(r) => batch.push(r),
                        Err(_) => break,
                    }
                }
                let _span = info_span!("audit.append", records = batch.len()).entered();
                let first_id = next_id;
                let items = batch.iter().zip(first_id..).map(|(r, id)| (id, r.ts_ms, r));
                match log.append_batch(items) {
                    Ok(n) => written += n as u64,
                    Err(e) => warn!(error = %e, lost = batch.len(), "audit append failed"),
                }
                // ids of a failed batch are not reused
                next_id += batch.len() as u64;
                batch.clear();
            }
            written
        });
        let sink = ChannelAuditSink { tx, dropped: Arc::new(AtomicU64::new(0)) };
        (sink, Self { handle })
    }

    /// Wait until every sender is gone and the channel is drained. Returns records written.
    pub async fn finish(self) -> u64 {
        match self.handle.await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "audit writer task failed");
                0
            }
        }
    }
}
