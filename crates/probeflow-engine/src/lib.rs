//! Core pipeline engine for probeflow.
//!
//! One archive flows `storage::ArchiveSource -> parser -> row::Base ->
//! Sink`; the offline `dedup` module validates and promotes per-day
//! intermediate tables into production partitions.

pub mod dedup;
pub mod metrics;
pub mod objstore;
pub mod parser;
pub mod row;
pub mod storage;
pub mod task;
pub mod warehouse;

pub use parser::{Parser, TestMeta};
pub use row::{Base, Buffer, Row, Sink};
pub use storage::{ArchiveSource, NextTest, RetryPolicy, TestSource};
pub use task::Task;
