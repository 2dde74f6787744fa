//! Buffered structured logging into the catalog
//!
//! Entries accumulate in memory and hit the catalog either when the buffer
//! reaches its size threshold or when the periodic flusher fires, whichever
//! comes first. Terminal transitions flush unconditionally. A catalog that
//! refuses a batch only costs us that batch, not the run.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    catalog::{Catalog, LogEntry, LogStream},
    metrics::{histogram, HistTag},
};

pub const FLUSH_THRESHOLD: usize = 50;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct LogBuffer {
    catalog: Arc<Catalog>,
    stream: LogStream,
    entries: Mutex<Vec<LogEntry>>,
    last_flush: Mutex<Instant>,
}

impl LogBuffer {
    pub fn new(catalog: Arc<Catalog>, stream: LogStream) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            stream,
            entries: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
        })
    }

    pub fn push(&self, entry: LogEntry) {
        let should_flush = {
            let mut entries = self.entries.lock();
            entries.push(entry);
            entries.len() >= FLUSH_THRESHOLD
                || self.last_flush.lock().elapsed() >= FLUSH_INTERVAL
        };
        if should_flush {
            self.flush();
        }
    }

    pub fn flush(&self) {
        let batch: Vec<LogEntry> = {
            let mut entries = self.entries.lock();
            if entries.is_empty() {
                *self.last_flush.lock() = Instant::now();
                return;
            }
            entries.drain(..).collect()
        };

        let flush_start = Instant::now();
        if let Err(err) = self.catalog.save_logs(self.stream, &batch) {
            // Dropping a log batch is survivable; killing the job is not
            warn!("Failed flushing {} log entries: {err:#}", batch.len());
        }
        histogram!(HistTag::CatalogFlush).record(flush_start.elapsed());
        *self.last_flush.lock() = Instant::now();
    }

    /// Background flusher honoring the 5 second liveness bound; aborted by
    /// dropping the returned handle's task at job end
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                buffer.flush();
            }
        })
    }
}
