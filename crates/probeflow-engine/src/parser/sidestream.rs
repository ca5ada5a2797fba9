//! Sidestream (web100 text) parser.
//!
//! A test file is named like `20170516T22:00:00Z_163.7.129.73_0.web100` and
//! holds one `K:` header line naming the web100 variables, followed by one
//! `C:` line per connection snapshot with values in header order.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use probeflow_types::{EtlError, Stats};
use serde::Serialize;

use crate::metrics;
use crate::parser::{Parser, TestMeta};
use crate::row::{Base, Sink, SinkRow};

const AF_INET: i32 = 2;
const AF_INET6: i32 = 10;

/// Legacy web100 variable names renamed by the kernel instrumentation
/// definitions; everything else passes through unchanged.
const LEGACY_NAMES: &[(&str, &str)] = &[
    ("DataBytesIn", "DataOctetsIn"),
    ("DataBytesOut", "DataOctetsOut"),
    ("PktsIn", "SegsIn"),
    ("PktsOut", "SegsOut"),
    ("DataPktsOut", "DataSegsOut"),
];

fn canonical_name(name: &str) -> &str {
    LEGACY_NAMES
        .iter()
        .find(|(legacy, _)| *legacy == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// Extracts the log time from a sidestream file name. The legacy form is
/// `20170203T00:00:00Z_ALL0.web100`, the current form
/// `20170315T01:00:00Z_173.205.3.39_0.web100`.
pub fn extract_log_time(test_name: &str) -> Result<i64> {
    if test_name.len() < 19 || !test_name.contains(".web100") {
        bail!("wrong sidestream filename: {test_name}");
    }
    let stamp = format!(
        "{}-{}-{}{}",
        &test_name[0..4],
        &test_name[4..6],
        &test_name[6..8],
        &test_name[8..17]
    );
    let t = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%dT%H:%M:%S")
        .with_context(|| format!("bad timestamp in sidestream filename: {test_name}"))?;
    Ok(t.and_utc().timestamp())
}

/// Parses the `K: <names...>` header into canonical variable names.
fn parse_k_header(header: &str) -> Result<Vec<String>> {
    let mut tokens = header.split_whitespace();
    if tokens.next() != Some("K:") {
        bail!("corrupted sidestream header: {header}");
    }
    let mut names = Vec::new();
    for token in tokens {
        names.push(canonical_name(token).to_string());
    }
    Ok(names)
}

/// Parses one `C: <values...>` snapshot line against the header names.
fn parse_one_line(snapshot: &str, var_names: &[String]) -> Result<BTreeMap<String, String>> {
    let values: Vec<&str> = snapshot.split_whitespace().collect();
    if values.first() != Some(&"C:") || values.len() != var_names.len() + 1 {
        bail!("corrupted sidestream snapshot line");
    }
    Ok(var_names
        .iter()
        .cloned()
        .zip(values[1..].iter().map(|v| v.to_string()))
        .collect())
}

fn ip_family(ip: &str) -> i32 {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => AF_INET,
        Ok(IpAddr::V6(_)) => AF_INET6,
        Err(_) => -1,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSpec {
    pub local_ip: String,
    pub local_af: i32,
    pub local_port: i32,
    pub remote_ip: String,
    pub remote_port: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SidestreamRow {
    pub test_id: String,
    pub log_time: i64,
    pub connection: ConnectionSpec,
    /// Full snapshot keyed by canonical web100 variable name.
    pub snapshot: BTreeMap<String, String>,
}

impl SinkRow for SidestreamRow {
    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn row_from_snapshot(
    test_name: &str,
    log_time: i64,
    snapshot: BTreeMap<String, String>,
) -> Result<SidestreamRow> {
    let get = |key: &str| -> Result<&String> {
        snapshot
            .get(key)
            .with_context(|| format!("snapshot missing {key}"))
    };
    let local_ip = get("LocalAddress")?.clone();
    let local_port: i32 = get("LocalPort")?.parse().context("bad LocalPort")?;
    let remote_ip = get("RemAddress")?.clone();
    let remote_port: i32 = get("RemPort")?.parse().context("bad RemPort")?;
    Ok(SidestreamRow {
        test_id: test_name.to_string(),
        log_time,
        connection: ConnectionSpec {
            local_af: ip_family(&local_ip),
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        },
        snapshot,
    })
}

pub struct SidestreamParser {
    base: Base,
    table: &'static str,
    suffix: String,
}

impl SidestreamParser {
    pub fn new(sink: Arc<dyn Sink>, table: &'static str, suffix: &str, buf_size: usize) -> SidestreamParser {
        SidestreamParser {
            base: Base::new(table, sink, buf_size),
            table,
            suffix: suffix.to_string(),
        }
    }
}

impl Parser for SidestreamParser {
    fn is_parsable(&self, test_name: &str, _data: &[u8]) -> Option<&'static str> {
        test_name.ends_with(".web100").then_some("sidestream")
    }

    fn parse_and_insert(&mut self, _meta: &TestMeta, test_name: &str, data: &[u8]) -> Result<()> {
        let log_time = extract_log_time(test_name)?;
        let text = std::str::from_utf8(data)
            .with_context(|| format!("sidestream test {test_name} is not utf-8"))?;

        let mut var_names: Option<Vec<String>> = None;
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some(names) = &var_names else {
                var_names = Some(parse_k_header(line)?);
                continue;
            };
            // A corrupt snapshot line costs one row, not the file.
            let row = parse_one_line(line, names)
                .and_then(|snap| row_from_snapshot(test_name, log_time, snap));
            match row {
                Ok(row) => {
                    self.base.put(Box::new(row))?;
                    metrics::test_total(self.table, "ok");
                }
                Err(e) => {
                    metrics::test_total(self.table, "corrupt-snapshot");
                    tracing::warn!(test = test_name, error = %e, "skipping sidestream snapshot");
                }
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
