use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::ProvenanceRecord;
use crate::sink::ProvenanceSink;

pub const QUEUE_CAPACITY: usize = 1024;

/// Hands finished records to a background worker. Flushing never waits on
/// the sink.
#[derive(Clone)]
pub struct ProvenanceLogger {
    queue: mpsc::Sender<ProvenanceRecord>,
}

impl ProvenanceLogger {
    pub fn spawn(sink: Arc<dyn ProvenanceSink>) -> (Self, JoinHandle<()>) {
        Self::with_capacity(sink, QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        sink: Arc<dyn ProvenanceSink>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, jobs) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(jobs, sink));
        (Self { queue }, worker)
    }

    /// Enqueues `record` for submission. Taking the record by value makes a
    /// second flush of the same record impossible.
    pub fn flush(&self, record: ProvenanceRecord) {
        match self.queue.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::warn!(rid = record.rid(), "provenance queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                tracing::warn!(rid = record.rid(), "provenance worker stopped, dropping record");
            }
        }
    }
}

async fn run_worker(mut jobs: mpsc::Receiver<ProvenanceRecord>, sink: Arc<dyn ProvenanceSink>) {
    while let Some(record) = jobs.recv().await {
        let document = match record.to_turtle() {
            Ok(document) => document,
            Err(error) => {
                tracing::warn!(rid = record.rid(), %error, "refusing to log malformed record");
                continue;
            }
        };
        if let Err(error) = sink.submit(record.rid(), document).await {
            tracing::warn!(rid = record.rid(), %error, "could not create log entry");
        }
    }
    tracing::debug!("provenance worker finished");
}
