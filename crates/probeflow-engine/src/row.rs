//! Row buffering and the sink commit contract.
//!
//! Parsers hand rows to a [`Base`], which buffers them in a size-bounded
//! [`Buffer`] and commits full batches to a shared [`Sink`]. The buffer and
//! sink are safe to share across workers; a `Base` belongs to exactly one
//! parser instance.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use probeflow_types::{ActiveStats, EtlError, Stats};

use crate::metrics;

/// Opaque annotation payload attached by an external annotation service.
#[derive(Debug, Clone, Default)]
pub struct Annotations(pub serde_json::Value);

/// Optional per-row capability for attaching client/server annotations
/// before commit. Rows without it pass through untouched.
pub trait Annotatable {
    fn log_time(&self) -> DateTime<Utc>;
    /// Client IPs; a slice to support multi-hop traceroute rows.
    fn client_ips(&self) -> Vec<String>;
    fn server_ip(&self) -> Option<String>;
    /// Must tolerate missing annotations.
    fn annotate_clients(&mut self, annotations: &HashMap<String, Annotations>) -> Result<()>;
    /// Must tolerate `None`.
    fn annotate_server(&mut self, annotation: Option<&Annotations>) -> Result<()>;
}

/// A row bound for the sink. The buffer never inspects rows beyond the
/// optional annotation capability.
pub trait SinkRow: Send {
    /// Serialized form for JSON-oriented sinks.
    fn to_value(&self) -> serde_json::Value;

    fn as_annotatable(&mut self) -> Option<&mut dyn Annotatable> {
        None
    }
}

pub type Row = Box<dyn SinkRow>;

/// An [`Annotatable`] that annotates nothing; embed it to satisfy the
/// capability for rows with no network endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAnnotator;

impl Annotatable for NullAnnotator {
    fn log_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn client_ips(&self) -> Vec<String> {
        Vec::new()
    }
    fn server_ip(&self) -> Option<String> {
        None
    }
    fn annotate_clients(&mut self, _annotations: &HashMap<String, Annotations>) -> Result<()> {
        Ok(())
    }
    fn annotate_server(&mut self, _annotation: Option<&Annotations>) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a failed commit: how much of the batch landed, and why the
/// rest did not.
#[derive(Debug)]
pub struct CommitFailure {
    pub committed: usize,
    pub error: anyhow::Error,
}

/// Batch commit endpoint. Implementations must be thread-safe; `commit` is
/// synchronous and blocking and may land a prefix of the batch before
/// failing.
pub trait Sink: Send + Sync {
    fn commit(&self, rows: Vec<Row>, label: &str) -> Result<usize, CommitFailure>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Thread-safe, size-bounded row buffer.
///
/// `append` either grows the buffer or, when full, swaps in a fresh backing
/// store seeded with the new row and hands the full prior batch to the
/// caller, which then owns it.
pub struct Buffer {
    size: usize,
    rows: Mutex<Vec<Row>>,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        Buffer {
            size,
            rows: Mutex::new(Vec::with_capacity(size)),
        }
    }

    /// Appends a row. Returns `Some(batch)` when the buffer was already
    /// full; the batch must be handled by the caller.
    pub fn append(&self, row: Row) -> Option<Vec<Row>> {
        let mut rows = self.rows.lock().expect("buffer lock poisoned");
        if rows.len() < self.size {
            rows.push(row);
            return None;
        }
        let mut fresh = Vec::with_capacity(self.size);
        fresh.push(row);
        Some(std::mem::replace(&mut *rows, fresh))
    }

    /// Drains the buffer, returning all pending rows.
    pub fn reset(&self) -> Vec<Row> {
        let mut rows = self.rows.lock().expect("buffer lock poisoned");
        std::mem::replace(&mut *rows, Vec::with_capacity(self.size))
    }
}

/// Buffering sink driver embedded by each parser.
///
/// Not safe for concurrent use by multiple parsers; the underlying buffer,
/// stats, and sink are.
pub struct Base {
    sink: Arc<dyn Sink>,
    buf: Buffer,
    label: String,
    stats: ActiveStats,
}

impl Base {
    pub fn new(label: impl Into<String>, sink: Arc<dyn Sink>, buf_size: usize) -> Base {
        Base {
            sink,
            buf: Buffer::new(buf_size),
            label: label.into(),
            stats: ActiveStats::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stats(&self) -> Stats {
        self.stats.get()
    }

    /// Task-level error, judged from failed rows or other criteria.
    pub fn task_error(&self) -> Option<EtlError> {
        None
    }

    /// Adds a row to the buffer; when that displaces a full batch, commits
    /// it. Commit order within the batch is preserved by the sink contract;
    /// no ordering is guaranteed across batches from different parsers.
    pub fn put(&self, row: Row) -> Result<(), EtlError> {
        let batch = self.buf.append(row);
        self.stats.inc();
        if let Some(batch) = batch {
            self.stats.move_to_pending(batch.len() as i64);
            if let Err(e) = self.commit(batch) {
                metrics::test_total(&self.label, "put-error");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Synchronously commits any buffered rows.
    pub fn flush(&self) -> Result<(), EtlError> {
        let rows = self.buf.reset();
        self.stats.move_to_pending(rows.len() as i64);
        self.commit(rows)
    }

    fn commit(&self, rows: Vec<Row>) -> Result<(), EtlError> {
        let total = rows.len();
        match self.sink.commit(rows, &self.label) {
            Ok(committed) => {
                self.stats.done(committed as i64, false);
                if committed < total {
                    tracing::warn!(
                        label = %self.label,
                        committed,
                        total,
                        "sink committed a partial batch without error"
                    );
                    self.stats.done((total - committed) as i64, true);
                }
                Ok(())
            }
            Err(CommitFailure { committed, error }) => {
                if committed > 0 {
                    self.stats.done(committed as i64, false);
                }
                self.stats.done((total - committed) as i64, true);
                tracing::error!(label = %self.label, error = %error, "commit failed");
                Err(EtlError::Commit(error))
            }
        }
    }
}

/// Sink writing each row as one JSON line. Used by local runs and tests in
/// place of the warehouse streaming writer.
pub struct JsonlWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlWriter<W> {
    pub fn new(out: W) -> JsonlWriter<W> {
        JsonlWriter { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().expect("writer lock poisoned")
    }
}

impl<W: Write + Send> Sink for JsonlWriter<W> {
    fn commit(&self, rows: Vec<Row>, _label: &str) -> Result<usize, CommitFailure> {
        let mut out = self.out.lock().expect("writer lock poisoned");
        for (i, row) in rows.iter().enumerate() {
            let write = serde_json::to_writer(&mut *out, &row.to_value())
                .map_err(anyhow::Error::from)
                .and_then(|()| out.write_all(b"\n").map_err(anyhow::Error::from));
            if let Err(error) = write {
                return Err(CommitFailure { committed: i, error });
            }
        }
        Ok(rows.len())
    }

    fn close(&self) -> Result<()> {
        self.out.lock().expect("writer lock poisoned").flush()?;
        Ok(())
    }
}
