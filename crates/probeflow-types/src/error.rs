//! Error taxonomy for the pipeline core.
//!
//! Every failure the core surfaces to callers is a tagged [`EtlError`]
//! variant, so tests and drivers can branch on the kind instead of matching
//! message strings. Collaborator errors (storage, warehouse, sink) travel
//! inside the relevant variant.

use crate::path::PathError;

/// Errors surfaced by the pipeline core.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// The archive URI failed classification.
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    /// A tar entry exceeded the per-file size cap; its body was skipped.
    #[error("oversize file: {name} ({size} bytes)")]
    OversizeFile { name: String, size: u64 },

    /// A warehouse table was a view or other non-regular table.
    #[error("not a regular table: {0}")]
    NotRegularTable(String),

    /// The source table is older than the destination partition.
    #[error("source table {src} older than destination partition")]
    SrcOlderThanDest { src: String },

    /// The source reflects too few task files relative to the destination.
    #[error("too few tasks: source {src} vs destination {dest}")]
    TooFewTasks { src: u64, dest: u64 },

    /// The source reflects too few tests relative to the destination.
    #[error("too few tests: source {src} vs destination {dest}")]
    TooFewTests { src: u64, dest: u64 },

    /// A batch of rows could not be committed to the sink.
    #[error("failed to commit row(s): {0}")]
    Commit(#[source] anyhow::Error),
}

impl EtlError {
    /// Short stable tag for metrics and log labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::InvalidPath(_) => "invalid_path",
            EtlError::OversizeFile { .. } => "oversize_file",
            EtlError::NotRegularTable(_) => "not_regular_table",
            EtlError::SrcOlderThanDest { .. } => "src_older_than_dest",
            EtlError::TooFewTasks { .. } => "too_few_tasks",
            EtlError::TooFewTests { .. } => "too_few_tests",
            EtlError::Commit(_) => "commit",
        }
    }
}
