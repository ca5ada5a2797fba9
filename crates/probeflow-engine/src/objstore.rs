//! Object storage contract.
//!
//! The pipeline reads archives from, and enumerates, a remote object store.
//! The network binding is a collaborator; this module fixes the contract and
//! ships a filesystem-backed implementation used by tests and local runs.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Result of a prefix listing: object names plus, when a delimiter was
/// given, the sub-prefixes directly below it.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<String>,
    pub prefixes: Vec<String>,
}

/// Read access to a bucketed object store.
///
/// `open` returns a plain byte stream; deadlines are enforced by the
/// implementation, and expiry surfaces as a read error mid-stream.
pub trait ObjectClient: Send + Sync {
    fn open(&self, bucket: &str, object: &str, timeout: Duration) -> Result<Box<dyn Read + Send>>;

    /// Lists objects under `prefix`. With a delimiter, names containing it
    /// past the prefix are rolled up into `prefixes`, like a GCS delimited
    /// listing.
    fn list(&self, bucket: &str, prefix: &str, delimiter: Option<char>) -> Result<Listing>;
}

/// Splits `gs://bucket/object` into its bucket and object name.
pub fn split_gs_uri(uri: &str) -> Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("gs://")
        .with_context(|| format!("invalid object uri: {uri}"))?;
    match rest.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => Ok((bucket, object)),
        _ => bail!("invalid object uri: {uri}"),
    }
}

/// Filesystem-backed [`ObjectClient`]: buckets are directories under a root,
/// objects are files below them.
#[derive(Debug, Clone)]
pub struct FsClient {
    root: PathBuf,
}

impl FsClient {
    pub fn new(root: impl Into<PathBuf>) -> FsClient {
        FsClient { root: root.into() }
    }
}

impl ObjectClient for FsClient {
    fn open(&self, bucket: &str, object: &str, _timeout: Duration) -> Result<Box<dyn Read + Send>> {
        let path = self.root.join(bucket).join(object);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open object {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn list(&self, bucket: &str, prefix: &str, delimiter: Option<char>) -> Result<Listing> {
        let base = self.root.join(bucket);
        let mut names = Vec::new();
        collect_files(&base, &base, &mut names)?;
        names.sort();

        let mut listing = Listing::default();
        for name in names {
            if !name.starts_with(prefix) {
                continue;
            }
            match delimiter.and_then(|d| name[prefix.len()..].find(d)) {
                Some(pos) => {
                    let sub = name[..prefix.len() + pos + 1].to_string();
                    if listing.prefixes.last() != Some(&sub) {
                        listing.prefixes.push(sub);
                    }
                }
                None => listing.objects.push(name),
            }
        }
        Ok(listing)
    }
}

fn collect_files(base: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // A missing bucket lists as empty, matching remote stores.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .expect("child path under base")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}
