//! The replicated log. Index 0 is a sentinel entry with term 0 and no command, which keeps the
//! AppendEntries consistency check free of special cases: `prev_log_index == 0` always matches.

use crate::replica::persistent_state::Term;
use bytes::Bytes;
use std::fmt;

/// Position of an entry in the log. Indices are contiguous starting from the sentinel at 0; the
/// first real entry is at index 1.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn plus(&self, delta: u64) -> Index {
        Index(self.0 + delta)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One slot in the log: an opaque command bound to the term whose leader appended it. The entry's
/// index is its position in the log, so it isn't stored here.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LogEntry {
    pub(crate) term: Term,
    pub(crate) data: Bytes,
}

pub(crate) struct RaftLog {
    // entries[0] is always the sentinel.
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub(crate) fn new() -> Self {
        RaftLog {
            entries: vec![LogEntry {
                term: Term::new(0),
                data: Bytes::new(),
            }],
        }
    }

    pub(crate) fn last_index(&self) -> Index {
        Index::new((self.entries.len() - 1) as u64)
    }

    pub(crate) fn last_term(&self) -> Term {
        // Non-empty by construction: the sentinel is never removed.
        self.entries[self.entries.len() - 1].term
    }

    pub(crate) fn term_at(&self, index: Index) -> Option<Term> {
        self.entries.get(index.as_u64() as usize).map(|e| e.term)
    }

    pub(crate) fn entry(&self, index: Index) -> Option<&LogEntry> {
        self.entries.get(index.as_u64() as usize)
    }

    pub(crate) fn append(&mut self, entry: LogEntry) -> Index {
        self.entries.push(entry);
        self.last_index()
    }

    /// Removes the entry at `from_index` and everything after it. The sentinel can't be removed.
    pub(crate) fn truncate_from(&mut self, from_index: Index) {
        debug_assert!(from_index.as_u64() >= 1, "attempted to truncate the sentinel");
        self.entries.truncate((from_index.as_u64() as usize).max(1));
    }

    /// Entries at `from_index` and after. Empty slice if `from_index` is past the end.
    pub(crate) fn entries_from(&self, from_index: Index) -> &[LogEntry] {
        let start = from_index.as_u64() as usize;
        if start >= self.entries.len() {
            &[]
        } else {
            &self.entries[start..]
        }
    }

    /// All real entries, for the persistence codec. The sentinel is implied.
    pub(crate) fn entries_after_sentinel(&self) -> &[LogEntry] {
        &self.entries[1..]
    }
}
