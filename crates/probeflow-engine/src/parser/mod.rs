//! Parser contract and the registry of concrete parsers.

pub mod ndt;
pub mod sidestream;
pub mod switch;

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use probeflow_types::{DataType, EtlError, Stats};

use crate::row::Sink;

pub use ndt::NdtParser;
pub use sidestream::SidestreamParser;
pub use switch::SwitchParser;

/// Archive-level context attached to every row a parser emits, so rows from
/// the same archive join downstream.
#[derive(Debug, Clone)]
pub struct TestMeta {
    /// Full archive URL, e.g. `gs://bucket/switch/2021/06/01/...tgz`.
    pub archive_url: String,
    /// The archive's calendar date.
    pub date: NaiveDate,
}

/// Version string recorded on every emitted row.
pub(crate) fn parser_version() -> String {
    concat!("probeflow-", env!("CARGO_PKG_VERSION")).to_string()
}

/// One datatype's parser, driving rows into an embedded [`crate::row::Base`].
pub trait Parser: Send {
    /// Cheap pre-check: returns the canonical test type when this parser
    /// wants the payload. Inspects the name and at most a header's worth of
    /// bytes; never allocates per-row state.
    fn is_parsable(&self, test_name: &str, data: &[u8]) -> Option<&'static str>;

    /// Transforms one test payload into zero or more rows on the sink
    /// buffer. Data errors are the payload's problem; sink errors come back
    /// as [`EtlError::Commit`] and are fatal to the task.
    fn parse_and_insert(&mut self, meta: &TestMeta, test_name: &str, data: &[u8]) -> Result<()>;

    /// Drains the last partial batch to the sink.
    fn flush(&mut self) -> Result<(), EtlError>;

    fn table_name(&self) -> &str;
    fn full_table_name(&self) -> String;
    fn stats(&self) -> Stats;
    fn task_error(&self) -> Option<EtlError>;
}

/// Builds the parser registered for a datatype, or `None` when the datatype
/// has no in-process parser (its rows are produced by an external worker).
pub fn new_parser(
    data_type: DataType,
    sink: Arc<dyn Sink>,
    suffix: &str,
) -> Option<Box<dyn Parser>> {
    let table = data_type.table();
    let buf_size = data_type.buffer_size();
    match data_type {
        DataType::Disco => Some(Box::new(SwitchParser::new(sink, table, suffix, buf_size))),
        DataType::Sidestream => Some(Box::new(SidestreamParser::new(sink, table, suffix, buf_size))),
        DataType::Ndt => Some(Box::new(NdtParser::new(sink, table, suffix, buf_size))),
        DataType::Traceroute | DataType::Invalid => None,
    }
}
