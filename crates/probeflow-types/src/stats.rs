//! Row accounting shared by the buffer, sink driver, and task pipeline.

use std::sync::RwLock;

/// A snapshot of row counts for one parser/sink pairing.
///
/// Rows move `buffered -> pending -> committed | failed`; the sum of all
/// four only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Rows buffered but not yet submitted.
    pub buffered: i64,
    /// Rows submitted to the sink and awaiting the commit result.
    pub pending: i64,
    pub committed: i64,
    pub failed: i64,
}

impl Stats {
    /// Total rows handled, in any state.
    pub fn total(&self) -> i64 {
        self.buffered + self.pending + self.committed + self.failed
    }
}

/// Thread-safe, updatable [`Stats`].
#[derive(Debug, Default)]
pub struct ActiveStats {
    inner: RwLock<Stats>,
}

impl ActiveStats {
    pub fn get(&self) -> Stats {
        *self.inner.read().expect("stats lock poisoned")
    }

    /// Records one newly buffered row.
    pub fn inc(&self) {
        self.inner.write().expect("stats lock poisoned").buffered += 1;
    }

    /// Moves `n` rows from buffered to pending.
    pub fn move_to_pending(&self, n: i64) {
        let mut s = self.inner.write().expect("stats lock poisoned");
        s.buffered -= n;
        if s.buffered < 0 {
            tracing::warn!(buffered = s.buffered, "BROKEN: negative buffered count");
        }
        s.pending += n;
    }

    /// Resolves `n` pending rows as committed (`failed == false`) or failed.
    pub fn done(&self, n: i64, failed: bool) {
        let mut s = self.inner.write().expect("stats lock poisoned");
        s.pending -= n;
        if s.pending < 0 {
            tracing::warn!(pending = s.pending, "BROKEN: negative pending count");
        }
        if failed {
            s.failed += n;
        } else {
            s.committed += n;
        }
    }
}
