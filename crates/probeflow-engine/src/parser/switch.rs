//! Switch (DISCO) telemetry parser.
//!
//! An archive entry is a stream of JSON objects, one per metric, each
//! carrying a run of ten-second samples for one machine/site. Samples with
//! the same timestamp across objects describe the same instant and fold
//! into a single output row keyed `<machine>-<site>-<timestamp>`.
//!
//! Two wire formats exist. DISCOv1 (collectd, `.json` entries) timestamps
//! mark the *start* of a sample window and carry one overlap sample past
//! the hour; DISCOv2 (`.jsonl` entries) timestamps mark the window *end*
//! and carry no overlap. v1 is normalized to v2 here: the overlap sample is
//! dropped and ten seconds are added to the rest.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use probeflow_types::{EtlError, Stats};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::parser::{Parser, TestMeta};
use crate::row::{Base, Sink, SinkRow};

static MACHINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"mlab[0-9]").expect("valid machine regex"));
static SITE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"s1[\-\.]([a-z]{3}[0-9t]{2})").expect("valid site regex"));

/// DISCOv2 deployment date; the start of the window in which
/// `switch.octets.local.{tx,rx}` values were collected incorrectly.
fn discov2_deploy_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 9, 9).expect("valid date")
}

/// The date the local octets collection was fixed; the end of the window.
fn discov2_fix_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 19).expect("valid date")
}

/// One raw sample as shipped by DISCO. Values are floats to accommodate
/// v1's collectd output; they are truncated to integers in the summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct Sample {
    pub timestamp: i64,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub counter: f64,
}

/// One metric object from a switch archive entry, v1 or v2.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct RawSwitchStats {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub experiment: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub sample: Vec<Sample>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParseInfo {
    pub version: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "ArchiveURL")]
    pub archive_url: String,
    pub filename: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawData {
    pub metrics: Vec<RawSwitchStats>,
}

/// Per-instant summary: one delta/counter pair per known metric, populated
/// from samples by [`set_summary`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwitchSummary {
    pub machine: String,
    pub site: String,
    pub collection_time: DateTime<Utc>,
    pub switch_octets_uplink_tx: i64,
    pub switch_octets_uplink_tx_counter: i64,
    pub switch_octets_uplink_rx: i64,
    pub switch_octets_uplink_rx_counter: i64,
    pub switch_octets_local_tx: i64,
    pub switch_octets_local_tx_counter: i64,
    pub switch_octets_local_rx: i64,
    pub switch_octets_local_rx_counter: i64,
    pub switch_unicast_uplink_tx: i64,
    pub switch_unicast_uplink_tx_counter: i64,
    pub switch_unicast_uplink_rx: i64,
    pub switch_unicast_uplink_rx_counter: i64,
    pub switch_unicast_local_tx: i64,
    pub switch_unicast_local_tx_counter: i64,
    pub switch_unicast_local_rx: i64,
    pub switch_unicast_local_rx_counter: i64,
    pub switch_multicast_uplink_tx: i64,
    pub switch_multicast_uplink_tx_counter: i64,
    pub switch_multicast_uplink_rx: i64,
    pub switch_multicast_uplink_rx_counter: i64,
    pub switch_multicast_local_tx: i64,
    pub switch_multicast_local_tx_counter: i64,
    pub switch_multicast_local_rx: i64,
    pub switch_multicast_local_rx_counter: i64,
    pub switch_broadcast_uplink_tx: i64,
    pub switch_broadcast_uplink_tx_counter: i64,
    pub switch_broadcast_uplink_rx: i64,
    pub switch_broadcast_uplink_rx_counter: i64,
    pub switch_broadcast_local_tx: i64,
    pub switch_broadcast_local_tx_counter: i64,
    pub switch_broadcast_local_rx: i64,
    pub switch_broadcast_local_rx_counter: i64,
    pub switch_errors_uplink_tx: i64,
    pub switch_errors_uplink_tx_counter: i64,
    pub switch_errors_uplink_rx: i64,
    pub switch_errors_uplink_rx_counter: i64,
    pub switch_errors_local_tx: i64,
    pub switch_errors_local_tx_counter: i64,
    pub switch_errors_local_rx: i64,
    pub switch_errors_local_rx_counter: i64,
    pub switch_discards_uplink_tx: i64,
    pub switch_discards_uplink_tx_counter: i64,
    pub switch_discards_uplink_rx: i64,
    pub switch_discards_uplink_rx_counter: i64,
    pub switch_discards_local_tx: i64,
    pub switch_discards_local_tx_counter: i64,
    pub switch_discards_local_rx: i64,
    pub switch_discards_local_rx_counter: i64,
}

/// One output row: all samples for one machine/site/timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwitchRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub date: NaiveDate,
    pub parser: ParseInfo,
    pub a: SwitchSummary,
    pub raw: RawData,
}

impl SinkRow for SwitchRow {
    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Writes a sample's delta/counter into the summary slot named by the
/// metric. Unknown metrics are left for the raw record only.
fn set_summary(summary: &mut SwitchSummary, metric: &str, sample: &Sample, archive_date: NaiveDate) {
    let (delta, counter) = {
        let s = &mut *summary;
        match metric {
            "switch.octets.uplink.tx" => (&mut s.switch_octets_uplink_tx, &mut s.switch_octets_uplink_tx_counter),
            "switch.octets.uplink.rx" => (&mut s.switch_octets_uplink_rx, &mut s.switch_octets_uplink_rx_counter),
            "switch.octets.local.tx" => (&mut s.switch_octets_local_tx, &mut s.switch_octets_local_tx_counter),
            "switch.octets.local.rx" => (&mut s.switch_octets_local_rx, &mut s.switch_octets_local_rx_counter),
            "switch.unicast.uplink.tx" => (&mut s.switch_unicast_uplink_tx, &mut s.switch_unicast_uplink_tx_counter),
            "switch.unicast.uplink.rx" => (&mut s.switch_unicast_uplink_rx, &mut s.switch_unicast_uplink_rx_counter),
            "switch.unicast.local.tx" => (&mut s.switch_unicast_local_tx, &mut s.switch_unicast_local_tx_counter),
            "switch.unicast.local.rx" => (&mut s.switch_unicast_local_rx, &mut s.switch_unicast_local_rx_counter),
            "switch.multicast.uplink.tx" => (&mut s.switch_multicast_uplink_tx, &mut s.switch_multicast_uplink_tx_counter),
            "switch.multicast.uplink.rx" => (&mut s.switch_multicast_uplink_rx, &mut s.switch_multicast_uplink_rx_counter),
            "switch.multicast.local.tx" => (&mut s.switch_multicast_local_tx, &mut s.switch_multicast_local_tx_counter),
            "switch.multicast.local.rx" => (&mut s.switch_multicast_local_rx, &mut s.switch_multicast_local_rx_counter),
            "switch.broadcast.uplink.tx" => (&mut s.switch_broadcast_uplink_tx, &mut s.switch_broadcast_uplink_tx_counter),
            "switch.broadcast.uplink.rx" => (&mut s.switch_broadcast_uplink_rx, &mut s.switch_broadcast_uplink_rx_counter),
            "switch.broadcast.local.tx" => (&mut s.switch_broadcast_local_tx, &mut s.switch_broadcast_local_tx_counter),
            "switch.broadcast.local.rx" => (&mut s.switch_broadcast_local_rx, &mut s.switch_broadcast_local_rx_counter),
            "switch.errors.uplink.tx" => (&mut s.switch_errors_uplink_tx, &mut s.switch_errors_uplink_tx_counter),
            "switch.errors.uplink.rx" => (&mut s.switch_errors_uplink_rx, &mut s.switch_errors_uplink_rx_counter),
            "switch.errors.local.tx" => (&mut s.switch_errors_local_tx, &mut s.switch_errors_local_tx_counter),
            "switch.errors.local.rx" => (&mut s.switch_errors_local_rx, &mut s.switch_errors_local_rx_counter),
            "switch.discards.uplink.tx" => (&mut s.switch_discards_uplink_tx, &mut s.switch_discards_uplink_tx_counter),
            "switch.discards.uplink.rx" => (&mut s.switch_discards_uplink_rx, &mut s.switch_discards_uplink_rx_counter),
            "switch.discards.local.tx" => (&mut s.switch_discards_local_tx, &mut s.switch_discards_local_tx_counter),
            "switch.discards.local.rx" => (&mut s.switch_discards_local_rx, &mut s.switch_discards_local_rx_counter),
            _ => return,
        }
    };

    // DISCOv2 collected local octets incorrectly for over a year; store
    // zeros inside that window rather than known-bad values.
    if (metric == "switch.octets.local.tx" || metric == "switch.octets.local.rx")
        && archive_date > discov2_deploy_date()
        && archive_date < discov2_fix_date()
    {
        *delta = 0;
        *counter = 0;
        return;
    }

    *delta = sample.value as i64;
    *counter = sample.counter as i64;
}

pub struct SwitchParser {
    base: Base,
    table: &'static str,
    suffix: String,
}

impl SwitchParser {
    pub fn new(sink: Arc<dyn Sink>, table: &'static str, suffix: &str, buf_size: usize) -> SwitchParser {
        SwitchParser {
            base: Base::new(table, sink, buf_size),
            table,
            suffix: suffix.to_string(),
        }
    }
}

fn is_v2(test_name: &str) -> bool {
    test_name.ends_with("switch.jsonl") || test_name.ends_with("switch.jsonl.gz")
}

impl Parser for SwitchParser {
    fn is_parsable(&self, test_name: &str, _data: &[u8]) -> Option<&'static str> {
        // Entries look like "<date>-to-<date>-switch.json.gz"; note the
        // "-switch" before the suffix.
        let known = test_name.ends_with("switch.json")
            || test_name.ends_with("switch.jsonl")
            || test_name.ends_with("switch.json.gz")
            || test_name.ends_with("switch.jsonl.gz");
        known.then_some("switch")
    }

    fn parse_and_insert(&mut self, meta: &TestMeta, test_name: &str, data: &[u8]) -> Result<()> {
        let v2 = is_v2(test_name);
        // Groups samples sharing a timestamp into one row; iteration order
        // gives the ascending-timestamp emit order.
        let mut rows: BTreeMap<i64, SwitchRow> = BTreeMap::new();

        let stream = serde_json::Deserializer::from_slice(data).into_iter::<RawSwitchStats>();
        for record in stream {
            let mut record = record
                .with_context(|| format!("bad switch record in {test_name}"))?;

            if !v2 && !record.sample.is_empty() {
                // v1 includes one overlap sample past the hour; unused.
                record.sample.pop();
                for sample in &mut record.sample {
                    sample.timestamp += 10;
                }
            }

            for sample in std::mem::take(&mut record.sample) {
                let row = match rows.entry(sample.timestamp) {
                    std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::btree_map::Entry::Vacant(e) => {
                        let machine = MACHINE_RE
                            .find(&record.hostname)
                            .map(|m| m.as_str().to_string());
                        let site = SITE_RE
                            .captures(&record.experiment)
                            .map(|c| c[1].to_string());
                        let (Some(machine), Some(site)) = (machine, site) else {
                            tracing::warn!(
                                hostname = %record.hostname,
                                experiment = %record.experiment,
                                "cannot extract machine or site name"
                            );
                            continue;
                        };
                        e.insert(SwitchRow {
                            id: format!("{machine}-{site}-{}", sample.timestamp),
                            date: meta.date,
                            parser: ParseInfo {
                                version: super::parser_version(),
                                time: Utc::now(),
                                archive_url: meta.archive_url.clone(),
                                filename: test_name.to_string(),
                            },
                            a: SwitchSummary {
                                machine,
                                site,
                                collection_time: DateTime::from_timestamp(sample.timestamp, 0)
                                    .unwrap_or_default(),
                                ..SwitchSummary::default()
                            },
                            raw: RawData::default(),
                        })
                    }
                };

                row.raw.metrics.push(RawSwitchStats {
                    hostname: record.hostname.clone(),
                    experiment: record.experiment.clone(),
                    metric: record.metric.clone(),
                    sample: vec![sample],
                });
                set_summary(&mut row.a, &record.metric, &sample, meta.date);
            }
        }

        for (_, row) in rows {
            self.base.put(Box::new(row))?;
            metrics::test_total(self.table, "ok");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::testsink::MemorySink;

    fn meta(date: &str) -> TestMeta {
        TestMeta {
            archive_url: format!(
                "gs://archive/switch/{}/{}T000000Z-mlab1-sea02-switch-0001.tgz",
                date.replace('-', "/"),
                date.replace('-', "")
            ),
            date: date.parse().unwrap(),
        }
    }

    fn record(metric: &str, timestamps: &[(i64, f64, f64)]) -> String {
        let samples: Vec<String> = timestamps
            .iter()
            .map(|(t, v, c)| format!(r#"{{"timestamp":{t},"value":{v},"counter":{c}}}"#))
            .collect();
        format!(
            r#"{{"hostname":"mlab2.sea02.measurement-lab.org","experiment":"s1.sea02.measurement-lab.org","metric":"{metric}","sample":[{}]}}"#,
            samples.join(",")
        )
    }

    fn parse(name: &str, body: &str, date: &str) -> (Arc<MemorySink>, Vec<serde_json::Value>) {
        let sink = Arc::new(MemorySink::default());
        let mut parser = SwitchParser::new(sink.clone(), "disco_test", "", 100);
        parser.parse_and_insert(&meta(date), name, body.as_bytes()).unwrap();
        parser.flush().unwrap();
        let rows = sink.rows.lock().unwrap().clone();
        (sink, rows)
    }

    #[test]
    fn test_is_parsable_suffixes() {
        let parser = SwitchParser::new(Arc::new(MemorySink::default()), "disco_test", "", 100);
        for name in [
            "2021-06-01-to-2021-06-02-switch.json",
            "2021-06-01-to-2021-06-02-switch.jsonl",
            "2021-06-01-to-2021-06-02-switch.json.gz",
            "2021-06-01-to-2021-06-02-switch.jsonl.gz",
        ] {
            assert_eq!(parser.is_parsable(name, b""), Some("switch"), "{name}");
        }
        assert_eq!(parser.is_parsable("notes.txt", b""), None);
    }

    #[test]
    fn test_v2_samples_kept_verbatim_and_grouped() {
        let body = format!(
            "{}\n{}\n",
            record("switch.octets.uplink.tx", &[(100, 5.0, 50.0), (110, 6.0, 56.0)]),
            record("switch.octets.uplink.rx", &[(100, 7.0, 70.0), (110, 8.0, 78.0)]),
        );
        let (_, rows) = parse("x-switch.jsonl", &body, "2023-03-01");
        assert_eq!(rows.len(), 2);

        // Rows emitted in ascending timestamp order, two metrics folded in.
        assert_eq!(rows[0]["ID"], "mlab2-sea02-100");
        assert_eq!(rows[1]["ID"], "mlab2-sea02-110");
        assert_eq!(rows[0]["A"]["SwitchOctetsUplinkTx"], 5);
        assert_eq!(rows[0]["A"]["SwitchOctetsUplinkTxCounter"], 50);
        assert_eq!(rows[0]["A"]["SwitchOctetsUplinkRx"], 7);
        assert_eq!(rows[0]["Raw"]["Metrics"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_v1_drops_overlap_sample_and_shifts_timestamps() {
        // Three samples: the last is the overlap, the rest shift by +10s.
        let body = record(
            "switch.octets.uplink.tx",
            &[(100, 1.0, 10.0), (110, 2.0, 20.0), (120, 3.0, 30.0)],
        );
        let (_, rows) = parse("x-switch.json", &body, "2019-05-01");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ID"], "mlab2-sea02-110");
        assert_eq!(rows[1]["ID"], "mlab2-sea02-120");
        assert_eq!(rows[0]["A"]["SwitchOctetsUplinkTx"], 1);
    }

    #[test]
    fn test_local_octets_zeroed_inside_known_bad_window() {
        let body = record("switch.octets.local.tx", &[(100, 42.0, 420.0)]);
        let (_, rows) = parse("x-switch.jsonl", &body, "2021-06-01");
        assert_eq!(rows[0]["A"]["SwitchOctetsLocalTx"], 0);
        assert_eq!(rows[0]["A"]["SwitchOctetsLocalTxCounter"], 0);
        // The raw record keeps the shipped values either way.
        assert_eq!(rows[0]["Raw"]["Metrics"][0]["sample"][0]["value"], 42.0);
    }

    #[test]
    fn test_local_octets_stored_outside_known_bad_window() {
        let body = record("switch.octets.local.tx", &[(100, 42.9, 420.0)]);
        let (_, rows) = parse("x-switch.jsonl", &body, "2022-02-01");
        // Floats truncate to int on store.
        assert_eq!(rows[0]["A"]["SwitchOctetsLocalTx"], 42);
        assert_eq!(rows[0]["A"]["SwitchOctetsLocalTxCounter"], 420);
    }

    #[test]
    fn test_window_boundary_dates_are_exclusive() {
        for date in ["2020-09-09", "2022-01-19"] {
            let body = record("switch.octets.local.rx", &[(100, 9.0, 90.0)]);
            let (_, rows) = parse("x-switch.jsonl", &body, date);
            assert_eq!(rows[0]["A"]["SwitchOctetsLocalRx"], 9, "date {date}");
        }
    }

    #[test]
    fn test_unknown_metric_kept_in_raw_only() {
        let body = record("switch.frobnication.uplink.tx", &[(100, 1.0, 2.0)]);
        let (_, rows) = parse("x-switch.jsonl", &body, "2023-01-01");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Raw"]["Metrics"][0]["metric"], "switch.frobnication.uplink.tx");
        assert_eq!(rows[0]["A"]["SwitchOctetsUplinkTx"], 0);
    }

    #[test]
    fn test_bad_hostname_skips_sample() {
        let body = r#"{"hostname":"weird","experiment":"also-weird","metric":"switch.octets.uplink.tx","sample":[{"timestamp":100,"value":1}]}"#;
        let (_, rows) = parse("x-switch.jsonl", body, "2023-01-01");
        assert!(rows.is_empty());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let sink = Arc::new(MemorySink::default());
        let mut parser = SwitchParser::new(sink, "disco_test", "", 100);
        let err = parser
            .parse_and_insert(&meta("2023-01-01"), "x-switch.jsonl", b"{not json")
            .unwrap_err();
        assert!(err.to_string().contains("bad switch record"));
    }
}
