//! Process-wide counter facade.
//!
//! The pipeline only needs counters it can increment from hot paths and
//! read back in tests; export to a real metrics backend is a non-goal.
//! Initialized lazily at first use, never torn down.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

static COUNTERS: LazyLock<Mutex<HashMap<String, u64>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn inc(key: String) {
    let mut counters = COUNTERS.lock().expect("metrics lock poisoned");
    *counters.entry(key).or_insert(0) += 1;
}

/// Counts one storage-layer retry, labeled by table, phase ("next", "read",
/// "read zip"), and error classification.
pub fn retry_total(table: &str, phase: &str, kind: &str) {
    inc(format!("retry_total{{{table},{phase},{kind}}}"));
}

/// Counts one processed test payload, labeled by table and outcome
/// ("ok", "unparsable", "oversize", "parse-error", "put-error").
pub fn test_total(table: &str, outcome: &str) {
    inc(format!("test_total{{{table},{outcome}}}"));
}

/// Reads a counter back; absent counters are zero. Intended for tests.
pub fn get(name: &str, labels: &[&str]) -> u64 {
    let key = format!("{name}{{{}}}", labels.join(","));
    COUNTERS
        .lock()
        .expect("metrics lock poisoned")
        .get(&key)
        .copied()
        .unwrap_or(0)
}
