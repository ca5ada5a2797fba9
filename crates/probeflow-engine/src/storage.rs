//! Streaming archive source.
//!
//! An [`ArchiveSource`] yields one test payload at a time from a
//! (possibly gzip-compressed) tar object in remote storage. Remote reads
//! stall and fail transiently, so header and body acquisition each run
//! under an independent bounded retry loop with exponential backoff.
//!
//! The tar stream is driven block-by-block on a dedicated reader thread
//! (a failed read must be re-attempted in place, which a high-level entry
//! iterator does not allow) and bridged to the caller through a bounded
//! request/response channel pair. The thread exclusively owns the reader
//! stack; dropping it releases the entry decompressor, the archive
//! decompressor, and the object stream in that order.

use std::io::{self, Read};
use std::sync::mpsc::{Receiver, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use probeflow_types::path::PathError;
use probeflow_types::{DataPath, EtlError};

use crate::metrics;
use crate::objstore::{split_gs_uri, ObjectClient};

/// Default wall-clock deadline for reading one archive object.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(300 * 60);

const BLOCK_SIZE: usize = 512;

/// Bounded retry with exponential backoff for storage reads.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First sleep; doubles after every retryable failure.
    pub base_delay: Duration,
    /// Attempts before giving up and surfacing the error.
    pub max_trials: u32,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(16),
            max_trials: 10,
        }
    }
}

/// One payload pulled from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextTest {
    /// A regular file and its (entry-level decompressed) contents.
    File { name: String, data: Vec<u8> },
    /// A non-regular entry; surfaced so callers can count it, no body.
    Skipped { name: String },
    /// A regular file larger than the cap; body skipped, not read.
    Oversize { name: String, size: u64 },
}

/// Pull access to the test payloads of one archive.
pub trait TestSource: Send {
    /// Returns payloads in tar order; `Ok(None)` at end of archive.
    /// Entries larger than `max_size` surface as [`NextTest::Oversize`]
    /// without their body being read.
    fn next_test(&mut self, max_size: u64) -> Result<Option<NextTest>>;
}

enum Reply {
    Entry(NextTest),
    Eof,
    Fatal { phase: &'static str, message: String },
}

/// Streaming reader over one tar archive object.
#[derive(Debug)]
pub struct ArchiveSource {
    req_tx: Option<SyncSender<u64>>,
    resp_rx: Receiver<Reply>,
    handle: Option<JoinHandle<()>>,
    /// Sink table associated with this archive, used as a metric label.
    pub table_base: &'static str,
}

impl ArchiveSource {
    /// Opens `gs://bucket/path.tar[.gz]` through `client` with the default
    /// retry policy. The deadline bounds the whole read of the object.
    pub fn open(
        client: &dyn ObjectClient,
        uri: &str,
        timeout: Duration,
    ) -> Result<ArchiveSource> {
        ArchiveSource::open_with(client, uri, timeout, RetryPolicy::default())
    }

    pub fn open_with(
        client: &dyn ObjectClient,
        uri: &str,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<ArchiveSource> {
        let (bucket, object) = split_gs_uri(uri)?;
        if !(object.ends_with(".tar") || object.ends_with(".tgz") || object.ends_with(".tar.gz")) {
            return Err(EtlError::InvalidPath(PathError::Suffix(uri.to_string())).into());
        }
        let table_base = DataPath::validate(uri)
            .map(|p| p.data_type().table())
            .unwrap_or("invalid");

        let reader = client
            .open(bucket, object, timeout)
            .with_context(|| format!("failed to open archive {uri}"))?;
        let gzipped = object.to_lowercase().ends_with("gz");
        Ok(ArchiveSource::spawn(table_base, gzipped, reader, policy))
    }

    /// Builds a source over an already-open byte stream. `gzipped` selects
    /// archive-level decompression. Used by tests and local tools.
    pub fn from_reader(
        table_base: &'static str,
        gzipped: bool,
        reader: Box<dyn Read + Send>,
        policy: RetryPolicy,
    ) -> ArchiveSource {
        ArchiveSource::spawn(table_base, gzipped, reader, policy)
    }

    fn spawn(
        table_base: &'static str,
        gzipped: bool,
        reader: Box<dyn Read + Send>,
        policy: RetryPolicy,
    ) -> ArchiveSource {
        let (req_tx, req_rx) = std::sync::mpsc::sync_channel::<u64>(1);
        let (resp_tx, resp_rx) = std::sync::mpsc::sync_channel::<Reply>(1);
        let handle = std::thread::spawn(move || {
            let reader: Box<dyn Read + Send> = if gzipped {
                Box::new(GzDecoder::new(reader))
            } else {
                reader
            };
            reader_loop(reader, req_rx, resp_tx, policy, table_base);
        });
        ArchiveSource {
            req_tx: Some(req_tx),
            resp_rx,
            handle: Some(handle),
            table_base,
        }
    }

    /// Releases the reader stack. Idempotent; also run on drop.
    pub fn close(&mut self) {
        self.req_tx.take();
        // Pop any reply in flight so the reader is not parked in `send`
        // when it should be observing the closed request channel.
        while self.resp_rx.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl TestSource for ArchiveSource {
    fn next_test(&mut self, max_size: u64) -> Result<Option<NextTest>> {
        let req_tx = self
            .req_tx
            .as_ref()
            .context("archive source already closed")?;
        req_tx
            .send(max_size)
            .context("archive reader terminated unexpectedly")?;
        match self
            .resp_rx
            .recv()
            .context("archive reader terminated unexpectedly")?
        {
            Reply::Entry(entry) => Ok(Some(entry)),
            Reply::Eof => Ok(None),
            Reply::Fatal { phase, message } => {
                bail!("archive read failed in {phase} phase: {message}")
            }
        }
    }
}

impl Drop for ArchiveSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Reader thread
// ---------------------------------------------------------------------------

fn reader_loop(
    reader: Box<dyn Read + Send>,
    req_rx: Receiver<u64>,
    resp_tx: SyncSender<Reply>,
    policy: RetryPolicy,
    table_base: &'static str,
) {
    let mut stream = TarStream::new(reader);
    while let Ok(max_size) = req_rx.recv() {
        let reply = read_one(&mut stream, max_size, policy, table_base);
        if resp_tx.send(reply).is_err() {
            return;
        }
    }
}

fn read_one(
    stream: &mut TarStream,
    max_size: u64,
    policy: RetryPolicy,
    table_base: &'static str,
) -> Reply {
    // Header phase. EOF is never retried; "unexpected EOF" is terminal.
    let mut trial = 1u32;
    let mut delay = policy.base_delay;
    let header = loop {
        match stream.next_header() {
            Ok(None) => return Reply::Eof,
            Ok(Some(header)) => break header,
            Err(e) => {
                metrics::retry_total(table_base, "next", retry_kind(&e));
                tracing::warn!(trial, error = %e, "tar header read failed");
                if is_terminal(&e) || trial >= policy.max_trials {
                    return Reply::Fatal {
                        phase: "next",
                        message: e.to_string(),
                    };
                }
                std::thread::sleep(delay);
                delay *= 2;
                trial += 1;
            }
        }
    };

    let name = String::from_utf8_lossy(&header.path_bytes()).into_owned();
    let size = match header.entry_size() {
        Ok(size) => size,
        Err(e) => {
            return Reply::Fatal {
                phase: "next",
                message: format!("bad size field in {name}: {e}"),
            }
        }
    };

    if size > max_size {
        // Leave the body unread; the next header acquisition skips it.
        return Reply::Entry(NextTest::Oversize { name, size });
    }
    if !header.entry_type().is_file() {
        return Reply::Entry(NextTest::Skipped { name });
    }

    // Body phase, with its own trial counter and backoff. Bytes read before
    // a transient failure stay buffered, so a retry resumes mid-body.
    let entry_gz = name.to_lowercase().ends_with(".gz");
    let phase: &'static str = if entry_gz { "read zip" } else { "read" };
    // Sized from the header, but bounded; a corrupt size field must not
    // drive the allocator.
    let mut buf: Vec<u8> = Vec::with_capacity(padded(size).min(1 << 20) as usize);
    let mut trial = 1u32;
    let mut delay = policy.base_delay;
    loop {
        let result = stream.fill_body(&mut buf).and_then(|()| {
            if entry_gz {
                gunzip(&buf[..size as usize])
            } else {
                Ok(buf[..size as usize].to_vec())
            }
        });
        match result {
            Ok(data) => return Reply::Entry(NextTest::File { name, data }),
            Err(e) => {
                metrics::retry_total(table_base, phase, retry_kind(&e));
                tracing::warn!(trial, file = %name, error = %e, "tar body read failed");
                if is_terminal(&e) || trial >= policy.max_trials {
                    return Reply::Fatal {
                        phase,
                        message: format!("{name}: {e}"),
                    };
                }
                std::thread::sleep(delay);
                delay *= 2;
                trial += 1;
            }
        }
    }
}

/// Errors carrying "unexpected EOF" are truncation, not transience; retrying
/// them only delays the inevitable. Everything else retries.
fn is_terminal(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof || e.to_string().contains("unexpected EOF")
}

fn retry_kind(e: &io::Error) -> &'static str {
    let msg = e.to_string();
    if msg.contains("unexpected EOF") || e.kind() == io::ErrorKind::UnexpectedEof {
        "unexpected EOF"
    } else if msg.contains("stream error") {
        "stream error"
    } else {
        "other"
    }
}

fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

fn unexpected_eof(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("unexpected EOF {what}"))
}

enum BlockRead {
    Full,
    Eof,
}

/// Block-level tar traversal over a raw byte stream.
///
/// All partial progress survives a failed read so a retry resumes exactly
/// where the stream faulted: `pending` tracks the unconsumed padded body of
/// the current entry, and `block_filled` tracks a partially read header
/// block.
struct TarStream {
    inner: Box<dyn Read + Send>,
    pending: u64,
    eof: bool,
    block: [u8; BLOCK_SIZE],
    block_filled: usize,
}

impl TarStream {
    fn new(inner: Box<dyn Read + Send>) -> TarStream {
        TarStream {
            inner,
            pending: 0,
            eof: false,
            block: [0u8; BLOCK_SIZE],
            block_filled: 0,
        }
    }

    fn next_header(&mut self) -> io::Result<Option<tar::Header>> {
        if self.eof {
            return Ok(None);
        }
        self.skip_pending()?;

        match self.fill_block()? {
            BlockRead::Eof => {
                self.eof = true;
                return Ok(None);
            }
            BlockRead::Full => {}
        }
        if self.block.iter().all(|&b| b == 0) {
            // End-of-archive marker. Consume the second zero block when
            // present; a truncated trailer still ends the archive cleanly.
            let _ = self.fill_block();
            self.eof = true;
            return Ok(None);
        }

        let mut header = tar::Header::new_old();
        header.as_mut_bytes().copy_from_slice(&self.block);
        if !checksum_ok(&self.block, &header) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid tar header checksum",
            ));
        }
        self.pending = padded(header.entry_size()?);
        Ok(Some(header))
    }

    /// Discards any unread body bytes of the previous entry.
    fn skip_pending(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        while self.pending > 0 {
            let want = self.pending.min(scratch.len() as u64) as usize;
            match self.inner.read(&mut scratch[..want])? {
                0 => return Err(unexpected_eof("skipping tar entry body")),
                n => self.pending -= n as u64,
            }
        }
        Ok(())
    }

    /// Appends the remaining padded body bytes of the current entry to
    /// `buf`. On a transient failure, bytes already read stay in `buf` and
    /// `pending` reflects only what is still owed, so the call resumes.
    fn fill_body(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        while self.pending > 0 {
            let want = self.pending.min(scratch.len() as u64) as usize;
            match self.inner.read(&mut scratch[..want])? {
                0 => return Err(unexpected_eof("reading tar entry body")),
                n => {
                    buf.extend_from_slice(&scratch[..n]);
                    self.pending -= n as u64;
                }
            }
        }
        Ok(())
    }

    /// Fills the header block, distinguishing clean EOF (zero bytes at a
    /// block boundary) from truncation mid-block. A partially filled block
    /// is kept across calls; completion resets it for the next header.
    fn fill_block(&mut self) -> io::Result<BlockRead> {
        while self.block_filled < BLOCK_SIZE {
            match self.inner.read(&mut self.block[self.block_filled..])? {
                0 if self.block_filled == 0 => return Ok(BlockRead::Eof),
                0 => return Err(unexpected_eof("reading tar header block")),
                n => self.block_filled += n,
            }
        }
        self.block_filled = 0;
        Ok(BlockRead::Full)
    }
}

/// Header checksum: byte sum of the block with the checksum field read as
/// spaces.
fn checksum_ok(block: &[u8; BLOCK_SIZE], header: &tar::Header) -> bool {
    let stored = match header.cksum() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let sum: u64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 0x20 } else { u64::from(b) })
        .sum();
    sum == u64::from(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_micros(10),
            max_trials: 10,
        }
    }

    fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn drain(src: &mut ArchiveSource, max_size: u64) -> Vec<NextTest> {
        let mut out = Vec::new();
        while let Some(t) = src.next_test(max_size).unwrap() {
            out.push(t);
        }
        out
    }

    #[test]
    fn test_plain_tar_yields_files_in_order() {
        let archive = tar_of(&[("a/one.json", b"first"), ("a/two.json", b"second")]);
        let mut src = ArchiveSource::from_reader(
            "test",
            false,
            Box::new(Cursor::new(archive)),
            fast_policy(),
        );
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(
            tests,
            vec![
                NextTest::File { name: "a/one.json".into(), data: b"first".to_vec() },
                NextTest::File { name: "a/two.json".into(), data: b"second".to_vec() },
            ]
        );
        // EOF is sticky.
        assert!(src.next_test(1 << 20).unwrap().is_none());
    }

    #[test]
    fn test_gzipped_tar_roundtrip() {
        let files: Vec<(String, Vec<u8>)> = (0..8)
            .map(|i| (format!("t/{i:04}.json"), format!("payload-{i}").into_bytes()))
            .collect();
        let refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        let tgz = gzip_bytes(&tar_of(&refs));

        let mut src =
            ArchiveSource::from_reader("test", true, Box::new(Cursor::new(tgz)), fast_policy());
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(tests.len(), files.len());
        for ((name, data), test) in files.iter().zip(&tests) {
            assert_eq!(
                test,
                &NextTest::File { name: name.clone(), data: data.clone() }
            );
        }
    }

    #[test]
    fn test_gzipped_entry_is_decoded() {
        let inner = b"inner payload";
        let gz = gzip_bytes(inner);
        let archive = tar_of(&[("t/log.json.gz", gz.as_slice()), ("t/raw.json", b"raw")]);
        let mut src = ArchiveSource::from_reader(
            "test",
            false,
            Box::new(Cursor::new(archive)),
            fast_policy(),
        );
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(
            tests[0],
            NextTest::File { name: "t/log.json.gz".into(), data: inner.to_vec() }
        );
        assert_eq!(
            tests[1],
            NextTest::File { name: "t/raw.json".into(), data: b"raw".to_vec() }
        );
    }

    #[test]
    fn test_non_regular_entries_are_surfaced_without_body() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::dir());
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, "subdir/", std::io::empty()).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(4);
        file.set_mode(0o644);
        file.set_cksum();
        builder.append_data(&mut file, "subdir/f", &b"data"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut src = ArchiveSource::from_reader(
            "test",
            false,
            Box::new(Cursor::new(archive)),
            fast_policy(),
        );
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(tests[0], NextTest::Skipped { name: "subdir/".into() });
        assert_eq!(
            tests[1],
            NextTest::File { name: "subdir/f".into(), data: b"data".to_vec() }
        );
    }

    #[test]
    fn test_oversize_entry_skipped_without_reading_body() {
        let big = vec![0x55u8; 4096];
        let archive = tar_of(&[("small", b"ok"), ("big", &big), ("after", b"fine")]);
        let mut src = ArchiveSource::from_reader(
            "test",
            false,
            Box::new(Cursor::new(archive)),
            fast_policy(),
        );
        let tests = drain(&mut src, 1024);
        assert_eq!(
            tests,
            vec![
                NextTest::File { name: "small".into(), data: b"ok".to_vec() },
                NextTest::Oversize { name: "big".into(), size: 4096 },
                NextTest::File { name: "after".into(), data: b"fine".to_vec() },
            ]
        );
    }

    /// Fails with the given message once, at the given stream offset, then
    /// reads normally.
    struct FlakyReader {
        inner: Cursor<Vec<u8>>,
        fail_at: u64,
        message: &'static str,
        tripped: bool,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.tripped && self.inner.position() >= self.fail_at {
                self.tripped = true;
                return Err(io::Error::other(self.message));
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn test_transient_stream_error_is_retried() {
        let archive = tar_of(&[("one", &[0xAAu8; 1500]), ("two", b"after")]);
        let reader = FlakyReader {
            inner: Cursor::new(archive),
            // The body read of "one" starts right after its 512-byte header.
            fail_at: 512,
            message: "stream error: INTERNAL_ERROR",
            tripped: false,
        };
        let mut src =
            ArchiveSource::from_reader("test", false, Box::new(reader), fast_policy());
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(tests.len(), 2);
        assert_eq!(
            tests[0],
            NextTest::File { name: "one".into(), data: vec![0xAAu8; 1500] }
        );
        assert!(metrics::get("retry_total", &["test", "read", "stream error"]) >= 1);
    }

    #[test]
    fn test_transient_header_error_is_retried() {
        let archive = tar_of(&[("one", b"abc"), ("two", b"def")]);
        let reader = FlakyReader {
            inner: Cursor::new(archive),
            // Between the first entry (512 + 512 padded body) and the second
            // header.
            fail_at: 1024,
            message: "stream error: CANCEL",
            tripped: false,
        };
        let mut src =
            ArchiveSource::from_reader("test", false, Box::new(reader), fast_policy());
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[1], NextTest::File { name: "two".into(), data: b"def".to_vec() });
    }

    /// Always fails, counting attempts.
    struct BrokenReader {
        attempts: std::sync::Arc<std::sync::atomic::AtomicU32>,
    }

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(io::Error::other("stream error: INTERNAL_ERROR"))
        }
    }

    #[test]
    fn test_retries_are_bounded() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let reader = BrokenReader { attempts: attempts.clone() };
        let mut src =
            ArchiveSource::from_reader("test", false, Box::new(reader), fast_policy());
        let err = src.next_test(1 << 20).unwrap_err();
        assert!(err.to_string().contains("next phase"), "{err}");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 10);
    }

    #[test]
    fn test_truncated_archive_is_terminal_not_retried() {
        let mut archive = tar_of(&[("one", &[0x11u8; 2000])]);
        archive.truncate(1000);
        let reads = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        struct CountingReader {
            inner: Cursor<Vec<u8>>,
            reads: std::sync::Arc<std::sync::atomic::AtomicU32>,
        }
        impl Read for CountingReader {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.reads
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                self.inner.read(buf)
            }
        }
        let reader = CountingReader { inner: Cursor::new(archive), reads: reads.clone() };
        let mut src =
            ArchiveSource::from_reader("test", false, Box::new(reader), fast_policy());
        let err = src.next_test(1 << 20).unwrap_err();
        assert!(err.to_string().contains("unexpected EOF"), "{err}");
        // Terminal: no retry storm against a truncated object.
        assert!(reads.load(std::sync::atomic::Ordering::SeqCst) <= 4);
    }

    #[test]
    fn test_open_rejects_bad_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let client = crate::objstore::FsClient::new(dir.path());
        let err = ArchiveSource::open(
            &client,
            "gs://bucket/ndt/2016/01/26/file.zip",
            DEFAULT_OPEN_TIMEOUT,
        )
        .unwrap_err();
        assert!(err.to_string().contains(".tar, .tgz, or .tar.gz"));
    }

    #[test]
    fn test_open_reads_from_object_client() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("bucket/switch/2021/06/01");
        std::fs::create_dir_all(&day).unwrap();
        let tgz = gzip_bytes(&tar_of(&[("t/x.json", b"{}")]));
        std::fs::write(day.join("20210601T000000Z-mlab1-sea03-switch-0001.tgz"), tgz).unwrap();

        let client = crate::objstore::FsClient::new(dir.path());
        let mut src = ArchiveSource::open(
            &client,
            "gs://bucket/switch/2021/06/01/20210601T000000Z-mlab1-sea03-switch-0001.tgz",
            DEFAULT_OPEN_TIMEOUT,
        )
        .unwrap();
        assert_eq!(src.table_base, "disco_test");
        let tests = drain(&mut src, 1 << 20);
        assert_eq!(
            tests,
            vec![NextTest::File { name: "t/x.json".into(), data: b"{}".to_vec() }]
        );
    }
}
