use crate::error::StoreError;
use crate::persist::{Index, Term};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// What a log entry carries. Config entries hold an encoded [`crate::persist::Config`]
/// in their payload; noop entries are empty markers appended by a fresh leader.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Command,
    Config,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
    pub data: Bytes,
}

/// Log is the durable, append-only entry store. Implementations must flush
/// before returning from `store_entries` and `store_committed_index`, and must
/// serialize their own reads against writes: the consensus loop writes while
/// the applier and replication tasks read concurrently.
pub trait Log: Send + Sync {
    /// Index of the oldest retained entry. One past `last_index` when the log
    /// holds no entries (empty log: first 1, last 0).
    fn first_index(&self) -> Result<Index, StoreError>;

    fn last_index(&self) -> Result<Index, StoreError>;

    /// Term of the entry at `last_index`, or of the compaction point when the
    /// log is empty after a snapshot reset.
    fn last_term(&self) -> Result<Term, StoreError>;

    /// Term of the entry at `index`. Answers at the compaction boundary
    /// (`first_index - 1`) as well, where no entry is readable.
    fn term_at(&self, index: Index) -> Result<Option<Term>, StoreError>;

    fn committed_index(&self) -> Result<Index, StoreError>;

    fn store_committed_index(&self, index: Index) -> Result<(), StoreError>;

    fn entry(&self, index: Index) -> Result<Option<LogEntry>, StoreError>;

    /// Entries in `[from, to]` inclusive, clipped to the retained range.
    fn entries(&self, from: Index, to: Index) -> Result<Vec<LogEntry>, StoreError>;

    /// Appends `entries`, which must be contiguous from `last_index + 1`.
    fn store_entries(&self, entries: Vec<LogEntry>) -> Result<(), StoreError>;

    /// Drops every entry with index greater than `index`.
    fn truncate_after(&self, index: Index) -> Result<(), StoreError>;

    /// Discards all entries and restarts the log after a snapshot at
    /// `(last_included_index, last_included_term)`.
    fn reset(&self, last_included_index: Index, last_included_term: Term)
        -> Result<(), StoreError>;
}

struct MemoryLogInner {
    /// entries[0] has index `first`.
    entries: Vec<LogEntry>,
    first: u64,
    committed: u64,
    /// Term at position `first - 1` (snapshot boundary).
    boundary_term: Term,
}

/// MemoryLog is the in-memory reference implementation, suitable for tests and
/// single-process clusters.
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
    fail_committed_index_stores: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog {
            inner: Mutex::new(MemoryLogInner {
                entries: Vec::new(),
                first: 1,
                committed: 0,
                boundary_term: Term::default(),
            }),
            fail_committed_index_stores: AtomicBool::new(false),
        }
    }

    /// Test hook: makes every subsequent `store_committed_index` fail.
    pub fn fail_committed_index_stores(&self) {
        self.fail_committed_index_stores.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLogInner> {
        self.inner.lock().expect("memory log mutex poisoned")
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogInner {
    fn last(&self) -> u64 {
        self.first + self.entries.len() as u64 - 1
    }

    fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first || index > self.last() {
            return None;
        }
        self.entries.get((index - self.first) as usize)
    }
}

impl Log for MemoryLog {
    fn first_index(&self) -> Result<Index, StoreError> {
        Ok(Index::new(self.lock().first))
    }

    fn last_index(&self) -> Result<Index, StoreError> {
        Ok(Index::new(self.lock().last()))
    }

    fn last_term(&self) -> Result<Term, StoreError> {
        let inner = self.lock();
        Ok(inner
            .entries
            .last()
            .map(|e| e.term)
            .unwrap_or(inner.boundary_term))
    }

    fn term_at(&self, index: Index) -> Result<Option<Term>, StoreError> {
        let inner = self.lock();
        if index.as_u64() == inner.first - 1 {
            return Ok(Some(inner.boundary_term));
        }
        Ok(inner.get(index.as_u64()).map(|e| e.term))
    }

    fn committed_index(&self) -> Result<Index, StoreError> {
        Ok(Index::new(self.lock().committed))
    }

    fn store_committed_index(&self, index: Index) -> Result<(), StoreError> {
        if self.fail_committed_index_stores.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected committed-index store failure",
            )));
        }
        let mut inner = self.lock();
        if index.as_u64() < inner.committed || index.as_u64() > inner.last() {
            return Err(StoreError::OutOfRange {
                index: index.as_u64(),
                first: inner.committed,
                last: inner.last(),
            });
        }
        inner.committed = index.as_u64();
        Ok(())
    }

    fn entry(&self, index: Index) -> Result<Option<LogEntry>, StoreError> {
        Ok(self.lock().get(index.as_u64()).cloned())
    }

    fn entries(&self, from: Index, to: Index) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.lock();
        let from = from.as_u64().max(inner.first);
        let to = to.as_u64().min(inner.last());
        let mut out = Vec::new();
        let mut i = from;
        while i <= to {
            if let Some(e) = inner.get(i) {
                out.push(e.clone());
            }
            i += 1;
        }
        Ok(out)
    }

    fn store_entries(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for entry in entries {
            if entry.index.as_u64() != inner.last() + 1 {
                return Err(StoreError::Corrupted(format!(
                    "non-contiguous append: index {} after {}",
                    entry.index,
                    inner.last()
                )));
            }
            inner.entries.push(entry);
        }
        Ok(())
    }

    fn truncate_after(&self, index: Index) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if index.as_u64() < inner.committed {
            return Err(StoreError::Corrupted(format!(
                "truncate at {} below committed index {}",
                index, inner.committed
            )));
        }
        if index.as_u64() < inner.last() {
            let keep = (index.as_u64() + 1).saturating_sub(inner.first) as usize;
            inner.entries.truncate(keep);
        }
        Ok(())
    }

    fn reset(
        &self,
        last_included_index: Index,
        last_included_term: Term,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.first = last_included_index.as_u64() + 1;
        inner.committed = last_included_index.as_u64();
        inner.boundary_term = last_included_term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(term),
            kind: EntryKind::Command,
            data: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn store_then_read_round_trip() {
        let log = MemoryLog::new();
        log.store_entries(vec![entry(1, 1), entry(2, 1)]).unwrap();

        assert_eq!(log.first_index().unwrap(), Index::new(1));
        assert_eq!(log.last_index().unwrap(), Index::new(2));
        assert_eq!(log.entry(Index::new(2)).unwrap().unwrap(), entry(2, 1));
        assert_eq!(log.term_at(Index::new(1)).unwrap(), Some(Term::new(1)));
    }

    #[test]
    fn truncate_then_read_absent() {
        let log = MemoryLog::new();
        log.store_entries(vec![entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();
        log.truncate_after(Index::new(1)).unwrap();

        assert_eq!(log.entry(Index::new(2)).unwrap(), None);
        assert_eq!(log.last_index().unwrap(), Index::new(1));
        // The log accepts a fresh entry at the truncated position.
        log.store_entries(vec![entry(2, 3)]).unwrap();
        assert_eq!(log.last_term().unwrap(), Term::new(3));
    }

    #[test]
    fn non_contiguous_append_rejected() {
        let log = MemoryLog::new();
        assert!(log.store_entries(vec![entry(2, 1)]).is_err());
    }

    #[test]
    fn committed_index_is_monotone_and_bounded() {
        let log = MemoryLog::new();
        log.store_entries(vec![entry(1, 1), entry(2, 1)]).unwrap();
        log.store_committed_index(Index::new(2)).unwrap();
        assert!(log.store_committed_index(Index::new(1)).is_err());
        assert!(log.store_committed_index(Index::new(3)).is_err());
        assert!(log.truncate_after(Index::new(1)).is_err());
    }

    #[test]
    fn reset_moves_the_boundary() {
        let log = MemoryLog::new();
        log.store_entries(vec![entry(1, 1), entry(2, 1)]).unwrap();
        log.reset(Index::new(10), Term::new(4)).unwrap();

        assert_eq!(log.first_index().unwrap(), Index::new(11));
        assert_eq!(log.last_index().unwrap(), Index::new(10));
        assert_eq!(log.last_term().unwrap(), Term::new(4));
        assert_eq!(log.term_at(Index::new(10)).unwrap(), Some(Term::new(4)));
        assert_eq!(log.committed_index().unwrap(), Index::new(10));
    }

    #[test]
    fn injected_commit_failure_surfaces() {
        let log = MemoryLog::new();
        log.store_entries(vec![entry(1, 1)]).unwrap();
        log.fail_committed_index_stores();
        assert!(log.store_committed_index(Index::new(1)).is_err());
    }
}
