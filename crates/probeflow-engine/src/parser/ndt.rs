//! NDT snaplog parser.
//!
//! NDT archives mix snaplogs with meta and comment files; only
//! `c2s_snaplog` / `s2c_snaplog` entries produce rows. The binary snaplog
//! decoding itself lives behind [`SnaplogDecoder`]; this parser owns the
//! gating, the size cap, and row assembly, and operates on the payload
//! bytes directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use probeflow_types::{EtlError, Stats};
use serde::Serialize;

use crate::metrics;
use crate::parser::{Parser, TestMeta};
use crate::row::{Base, Sink, SinkRow};

/// Snaplogs above this size are skipped rather than decoded.
pub const MAX_SNAPLOG_SIZE: usize = 10 * 1024 * 1024;

/// Decodes the final snapshot of a web100 snaplog. Returns `Ok(None)` for a
/// log holding no snapshots.
pub trait SnaplogDecoder: Send {
    fn decode(
        &self,
        test_name: &str,
        data: &[u8],
    ) -> Result<Option<BTreeMap<String, serde_json::Value>>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct NdtRow {
    pub test_id: String,
    pub direction: String,
    /// Final-snapshot web100 variables.
    pub web100_values: BTreeMap<String, serde_json::Value>,
}

impl SinkRow for NdtRow {
    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub struct NdtParser {
    base: Base,
    table: &'static str,
    suffix: String,
    decoder: Option<Box<dyn SnaplogDecoder>>,
}

impl NdtParser {
    pub fn new(sink: Arc<dyn Sink>, table: &'static str, suffix: &str, buf_size: usize) -> NdtParser {
        NdtParser {
            base: Base::new(table, sink, buf_size),
            table,
            suffix: suffix.to_string(),
            decoder: None,
        }
    }

    pub fn with_decoder(mut self, decoder: Box<dyn SnaplogDecoder>) -> NdtParser {
        self.decoder = Some(decoder);
        self
    }
}

fn direction(test_name: &str) -> Option<&'static str> {
    if test_name.ends_with("c2s_snaplog") {
        Some("c2s")
    } else if test_name.ends_with("s2c_snaplog") {
        Some("s2c")
    } else {
        None
    }
}

impl Parser for NdtParser {
    fn is_parsable(&self, test_name: &str, _data: &[u8]) -> Option<&'static str> {
        direction(test_name).map(|_| "ndt")
    }

    fn parse_and_insert(&mut self, _meta: &TestMeta, test_name: &str, data: &[u8]) -> Result<()> {
        let Some(direction) = direction(test_name) else {
            // Non-snaplog files carry no rows.
            return Ok(());
        };

        if data.len() > MAX_SNAPLOG_SIZE {
            metrics::test_total(self.table, "oversize");
            tracing::warn!(test = test_name, size = data.len(), "ignoring oversize snaplog");
            return Ok(());
        }

        let Some(decoder) = &self.decoder else {
            metrics::test_total(self.table, "no-decoder");
            return Ok(());
        };

        match decoder.decode(test_name, data)? {
            Some(values) => {
                self.base.put(Box::new(NdtRow {
                    test_id: test_name.to_string(),
                    direction: direction.to_string(),
                    web100_values: values,
                }))?;
                metrics::test_total(self.table, direction);
            }
            None => {
                // Snaplogs with zero snapshots are legal and rowless.
                metrics::test_total(self.table, "empty-snaplog");
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EtlError> {
        self.base.flush()
    }

    fn table_name(&self) -> &str {
        self.table
    }

    fn full_table_name(&self) -> String {
        format!("{}{}", self.table, self.suffix)
    }

    fn stats(&self) -> Stats {
        self.base.stats()
    }

    fn task_error(&self) -> Option<EtlError> {
        self.base.task_error()
    }
}
