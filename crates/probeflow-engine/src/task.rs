//! Per-archive processing: drive the archive source through a parser into
//! the sink, applying the per-payload error policy.

use std::sync::LazyLock;

use anyhow::Result;
use chrono::NaiveDate;
use probeflow_types::EtlError;
use regex::Regex;

use crate::metrics;
use crate::parser::{Parser, TestMeta};
use crate::storage::{NextTest, TestSource};

/// Per-file size cap applied while draining an archive.
pub const MAX_TEST_SIZE: u64 = 100 * 1024 * 1024;

static URL_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d{4})/([01]\d)/([0123]\d)/").expect("valid url date regex"));

/// Releases whatever the source was reading from; injected separately so
/// tests can drive a task over in-memory data.
pub trait Closer: Send {
    fn close(&mut self) -> Result<()>;
}

/// A [`Closer`] with nothing to release.
pub struct NullCloser;

impl Closer for NullCloser {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One archive bound to one parser.
pub struct Task {
    meta: TestMeta,
    source: Box<dyn TestSource>,
    parser: Box<dyn Parser>,
    closer: Box<dyn Closer>,
}

/// Extracts the archive's calendar date from the `/YYYY/MM/DD/` segment of
/// its URL.
fn archive_date(archive_url: &str) -> Option<NaiveDate> {
    let caps = URL_DATE_RE.captures(archive_url)?;
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

impl Task {
    pub fn new(
        archive_url: impl Into<String>,
        source: Box<dyn TestSource>,
        parser: Box<dyn Parser>,
        closer: Box<dyn Closer>,
    ) -> Task {
        let archive_url = archive_url.into();
        let date = archive_date(&archive_url).unwrap_or_else(|| {
            tracing::warn!(url = %archive_url, "archive url carries no date path");
            NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch date")
        });
        Task {
            meta: TestMeta { archive_url, date },
            source,
            parser,
            closer,
        }
    }

    /// Row accounting from the underlying parser.
    pub fn stats(&self) -> probeflow_types::Stats {
        self.parser.stats()
    }

    /// Drains the archive, dispatching each parsable payload to the parser.
    ///
    /// Returns the number of regular-file payloads seen, counting oversize
    /// and unparsable entries. Per-payload parse failures and oversize
    /// entries are logged and skipped; only post-retry storage errors and
    /// sink commit errors fail the task. With `force_full_read`, the
    /// per-file size cap is lifted and nothing is skipped as oversize.
    pub fn process_all_tests(&mut self, force_full_read: bool) -> Result<usize> {
        let max_size = if force_full_read { u64::MAX } else { MAX_TEST_SIZE };
        let table = self.parser.table_name().to_string();
        let mut n = 0usize;

        let drain_result = loop {
            let next = match self.source.next_test(max_size) {
                Ok(next) => next,
                Err(e) => break Err(e),
            };
            match next {
                None => break Ok(()),
                Some(NextTest::Skipped { name }) => {
                    tracing::debug!(file = %name, "skipping non-regular tar entry");
                }
                Some(NextTest::Oversize { name, size }) => {
                    n += 1;
                    metrics::test_total(&table, "oversize");
                    tracing::warn!(file = %name, size, "skipping oversize test file");
                }
                Some(NextTest::File { name, data }) => {
                    n += 1;
                    if self.parser.is_parsable(&name, &data).is_none() {
                        metrics::test_total(&table, "unparsable");
                        tracing::debug!(file = %name, "not parsable by this datatype");
                        continue;
                    }
                    if let Err(e) = self.parser.parse_and_insert(&self.meta, &name, &data) {
                        // Sink errors are fatal; data errors cost one file.
                        if let Some(etl) = e.downcast_ref::<EtlError>() {
                            if etl.kind() == "commit" {
                                break Err(e);
                            }
                        }
                        metrics::test_total(&table, "parse-error");
                        tracing::warn!(file = %name, error = %e, "failed to parse test");
                    }
                }
            }
        };

        match drain_result {
            Ok(()) => {
                let flush_result = self.parser.flush();
                let close_result = self.closer.close();
                flush_result?;
                close_result?;
                if let Some(e) = self.parser.task_error() {
                    return Err(e.into());
                }
                Ok(n)
            }
            Err(e) => {
                let _ = self.closer.close();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TestMeta;
    use crate::row::testsink::MemorySink;
    use crate::row::{Base, SinkRow};
    use probeflow_types::Stats;
    use std::sync::Arc;

    struct ScriptedSource {
        entries: std::vec::IntoIter<Result<Option<NextTest>>>,
    }

    impl ScriptedSource {
        fn new(entries: Vec<Result<Option<NextTest>>>) -> ScriptedSource {
            ScriptedSource { entries: entries.into_iter() }
        }
    }

    impl TestSource for ScriptedSource {
        fn next_test(&mut self, _max_size: u64) -> Result<Option<NextTest>> {
            self.entries.next().unwrap_or(Ok(None))
        }
    }

    struct NameRow(String);

    impl SinkRow for NameRow {
        fn to_value(&self) -> serde_json::Value {
            serde_json::json!({ "test": self.0 })
        }
    }

    /// Emits one row per ".test" payload with a non-empty body; fails on
    /// payloads containing "poison".
    struct StubParser {
        base: Base,
    }

    impl StubParser {
        fn new(sink: Arc<MemorySink>) -> StubParser {
            StubParser { base: Base::new("stub", sink, 100) }
        }
    }

    impl Parser for StubParser {
        fn is_parsable(&self, test_name: &str, _data: &[u8]) -> Option<&'static str> {
            test_name.ends_with(".test").then_some("stub")
        }

        fn parse_and_insert(&mut self, _meta: &TestMeta, test_name: &str, data: &[u8]) -> Result<()> {
            if data.windows(6).any(|w| w == b"poison") {
                anyhow::bail!("poisoned payload");
            }
            if !data.is_empty() {
                self.base.put(Box::new(NameRow(test_name.to_string())))?;
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), EtlError> {
            self.base.flush()
        }

        fn table_name(&self) -> &str {
            "stub"
        }

        fn full_table_name(&self) -> String {
            "stub".to_string()
        }

        fn stats(&self) -> Stats {
            self.base.stats()
        }

        fn task_error(&self) -> Option<EtlError> {
            None
        }
    }

    fn file(name: &str, data: &[u8]) -> Result<Option<NextTest>> {
        Ok(Some(NextTest::File { name: name.into(), data: data.to_vec() }))
    }

    const URL: &str = "gs://archive/ndt/2019/05/16/20190516T000000Z-mlab4-arn02-ndt-0001.tgz";

    #[test]
    fn test_count_includes_oversize_and_unparsable() {
        let entries = vec![
            file("a.test", b"x"),
            Ok(Some(NextTest::Skipped { name: "dir/".into() })),
            Ok(Some(NextTest::Oversize { name: "big.test".into(), size: 1 << 30 })),
            file("notes.txt", b"unparsable"),
            file("b.test", b"y"),
        ];
        let sink = Arc::new(MemorySink::default());
        let mut task = Task::new(
            URL,
            Box::new(ScriptedSource::new(entries)),
            Box::new(StubParser::new(sink.clone())),
            Box::new(NullCloser),
        );
        let n = task.process_all_tests(false).unwrap();
        // Four regular-file payloads; the directory entry does not count.
        assert_eq!(n, 4);
        assert_eq!(sink.committed(), 2);
    }

    #[test]
    fn test_zero_row_tests_count_but_commit_nothing() {
        // Ten tests, two of which produce no rows.
        let mut entries: Vec<Result<Option<NextTest>>> =
            (0..8).map(|i| file(&format!("t{i}.test"), b"data")).collect();
        entries.push(file("empty1.test", b""));
        entries.push(file("empty2.test", b""));

        let sink = Arc::new(MemorySink::default());
        let mut task = Task::new(
            URL,
            Box::new(ScriptedSource::new(entries)),
            Box::new(StubParser::new(sink.clone())),
            Box::new(NullCloser),
        );
        let n = task.process_all_tests(false).unwrap();
        assert_eq!(n, 10);
        assert_eq!(sink.committed(), 8);
    }

    #[test]
    fn test_parse_errors_do_not_fail_the_task() {
        let entries = vec![
            file("a.test", b"ok"),
            file("bad.test", b"poison"),
            file("b.test", b"ok"),
        ];
        let sink = Arc::new(MemorySink::default());
        let mut task = Task::new(
            URL,
            Box::new(ScriptedSource::new(entries)),
            Box::new(StubParser::new(sink.clone())),
            Box::new(NullCloser),
        );
        let n = task.process_all_tests(false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(sink.committed(), 2);
    }

    #[test]
    fn test_storage_error_aborts_the_task() {
        let entries = vec![
            file("a.test", b"ok"),
            Err(anyhow::anyhow!("archive read failed in next phase: boom")),
        ];
        let sink = Arc::new(MemorySink::default());
        let mut task = Task::new(
            URL,
            Box::new(ScriptedSource::new(entries)),
            Box::new(StubParser::new(sink.clone())),
            Box::new(NullCloser),
        );
        let err = task.process_all_tests(false).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_meta_date_comes_from_archive_url() {
        let entries = vec![file("a.test", b"x")];
        let sink = Arc::new(MemorySink::default());
        let parser = StubParser::new(sink);
        let mut task = Task::new(
            URL,
            Box::new(ScriptedSource::new(entries)),
            Box::new(parser),
            Box::new(NullCloser),
        );
        task.process_all_tests(false).unwrap();
        assert_eq!(task.meta.date, "2019-05-16".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn test_commit_error_is_fatal() {
        let entries: Vec<Result<Option<NextTest>>> =
            (0..5).map(|i| file(&format!("t{i}.test"), b"data")).collect();
        let sink = Arc::new(MemorySink { fail_after: Some(0), ..Default::default() });
        // Buffer of 2 rows forces a commit attempt mid-archive.
        let parser = StubParser { base: Base::new("stub", sink.clone(), 2) };
        let mut task = Task::new(
            URL,
            Box::new(ScriptedSource::new(entries)),
            Box::new(parser),
            Box::new(NullCloser),
        );
        let err = task.process_all_tests(false).unwrap_err();
        assert!(err.to_string().contains("failed to commit"));
    }
}
