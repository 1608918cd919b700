//! # storage
//!
//! why: abstract the durable home of term, vote, commit index and log entries
//! relations: consumed by log.rs; implemented here (memory) and by raft-storage (files)
//! what: Storage trait, PersistentState, MemoryStorage

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::log::{Index, LogEntry, Term};
use crate::node::NodeId;

/// Everything a node persists, as loaded on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: Index,
    pub log: Vec<LogEntry>,
}

/// Durable storage for raft state.
///
/// Every method must only return Ok once the write is durable: the node
/// acknowledges votes and appends on the strength of that promise.
pub trait Storage: Send {
    /// Load the persisted state (defaults for a fresh node).
    fn load_state(&self) -> io::Result<PersistentState>;

    /// Persist the current term and the vote cast in it.
    fn persist_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()>;

    /// Persist the commit index.
    fn persist_commit(&mut self, commit_index: Index) -> io::Result<()>;

    /// Append entries to the end of the log.
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// Read entries with index in `from..=to`.
    fn read_range(&self, from: Index, to: Index) -> io::Result<Vec<LogEntry>>;

    /// Remove the entry at `index` and everything after it.
    fn truncate_from(&mut self, index: Index) -> io::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: PersistentState,
    failing: bool,
}

/// In-memory storage for tests and simulations.
///
/// Clones share the same state, so a test can hand one clone to a node and
/// keep another to inspect it, inject write failures, or "restart" the node.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing = failing;
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))
    }

    fn lock_for_write(&self) -> io::Result<MutexGuard<'_, MemoryInner>> {
        let inner = self.lock()?;
        if inner.failing {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        Ok(inner)
    }
}

impl Storage for MemoryStorage {
    fn load_state(&self) -> io::Result<PersistentState> {
        Ok(self.lock()?.state.clone())
    }

    fn persist_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        let mut inner = self.lock_for_write()?;
        inner.state.term = term;
        inner.state.voted_for = voted_for;
        Ok(())
    }

    fn persist_commit(&mut self, commit_index: Index) -> io::Result<()> {
        self.lock_for_write()?.state.commit_index = commit_index;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.lock_for_write()?.state.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn read_range(&self, from: Index, to: Index) -> io::Result<Vec<LogEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .state
            .log
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect())
    }

    fn truncate_from(&mut self, index: Index) -> io::Result<()> {
        self.lock_for_write()?.state.log.retain(|e| e.index < index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_persists_term_and_vote() {
        let mut storage = MemoryStorage::new();
        storage.persist_vote(5, Some(2)).unwrap();

        let state = storage.load_state().unwrap();
        assert_eq!(state.term, 5);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn clones_share_state() {
        let mut storage = MemoryStorage::new();
        let observer = storage.clone();
        storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        assert_eq!(observer.load_state().unwrap().log.len(), 1);
    }

    #[test]
    fn read_range_is_inclusive() {
        let mut storage = MemoryStorage::new();
        let entries: Vec<_> = (1..=5).map(|i| LogEntry::new(1, i, vec![i as u8])).collect();
        storage.append_entries(&entries).unwrap();

        let range = storage.read_range(2, 4).unwrap();
        assert_eq!(range.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn injected_failure_blocks_writes_but_not_reads() {
        let mut storage = MemoryStorage::new();
        storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        storage.set_failing(true);

        assert!(storage.persist_vote(2, Some(1)).is_err());
        assert!(storage.truncate_from(1).is_err());
        assert_eq!(storage.load_state().unwrap().log.len(), 1);

        storage.set_failing(false);
        assert!(storage.persist_vote(2, Some(1)).is_ok());
    }
}
