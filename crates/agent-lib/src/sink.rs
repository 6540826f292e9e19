//! Row-oriented record sink
//!
//! Appends serializable rows to a CSV file from a blocking worker fed by a
//! bounded queue. Submitting never blocks: when the queue is full the row is
//! dropped, counted and logged. The header row is written only when the file
//! is new or empty, so restarts keep appending to the same file.

use crate::error::SinkError;
use crate::observability::AgentMetrics;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default queue depth between submitters and the writer
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// Cloneable submit side of a CSV record sink
pub struct RecordSink<T> {
    path: Arc<PathBuf>,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
    metrics: AgentMetrics,
}

impl<T> Clone for RecordSink<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> RecordSink<T>
where
    T: Serialize + Send + 'static,
{
    /// Open (or create) `path` and start the writer
    ///
    /// The returned handle resolves to the number of rows written once every
    /// clone of the sink has been dropped.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<(Self, JoinHandle<u64>), SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        let worker_path = path.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let mut written = 0u64;
            while let Some(row) = rx.blocking_recv() {
                if let Err(e) = writer.serialize(&row) {
                    warn!(path = %worker_path.display(), error = %e, "Failed to write record");
                    continue;
                }
                if let Err(e) = writer.flush() {
                    warn!(path = %worker_path.display(), error = %e, "Failed to flush records");
                }
                written += 1;
            }
            debug!(path = %worker_path.display(), rows = written, "Record sink closed");
            written
        });

        info!(path = %path.display(), new_file = needs_header, "Record sink opened");

        Ok((
            Self {
                path: Arc::new(path),
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                metrics: AgentMetrics::new(),
            },
            worker,
        ))
    }

    /// Queue one row without blocking; false if it was dropped
    pub fn submit(&self, row: T) -> bool {
        match self.tx.try_send(row) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_drop("queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_drop("writer stopped");
                false
            }
        }
    }

    fn record_drop(&self, reason: &str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.inc_sink_drops();
        warn!(
            path = %self.path.display(),
            reason = %reason,
            dropped_total = total,
            "Record dropped"
        );
    }
}

impl<T> RecordSink<T> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows dropped so far across all clones
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the writer is still accepting rows
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CycleRecord, SignalSample, SignalValue};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(sequence: u64, rate: Option<f64>) -> CycleRecord {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        CycleRecord {
            sequence,
            start_time: start,
            end_time: start + chrono::Duration::seconds(5),
            duration_secs: 5.0,
            interval_secs: 30.0,
            predicted_rate: rate,
            anomaly: None,
        }
    }

    #[tokio::test]
    async fn test_writes_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cycles.csv");

        let (sink, worker) = RecordSink::open(&path, 16).unwrap();
        assert!(sink.submit(record(1, Some(33.0))));
        assert!(sink.submit(record(2, None)));
        drop(sink);
        assert_eq!(worker.await.unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "sequence,start_time,end_time,duration_secs,interval_secs,predicted_rate,anomaly"
        );
        assert!(lines[1].starts_with("1,"));
        assert!(lines[1].contains(",33.0,"));
        assert!(lines[2].starts_with("2,"));
        assert!(lines[2].ends_with(",,"));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn test_appends_without_second_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("samples").join("load.csv");

        for value in [1.5, 2.5] {
            let (sink, worker) = RecordSink::open(&path, 4).unwrap();
            sink.submit(SignalSample {
                timestamp: Utc::now(),
                value: SignalValue::Float(value),
            });
            drop(sink);
            worker.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let headers = content.lines().filter(|l| *l == "timestamp,value").count();
        assert_eq!(headers, 1);
        assert_eq!(content.lines().count(), 3);
        assert!(content.lines().last().unwrap().ends_with(",2.5"));
    }
}
