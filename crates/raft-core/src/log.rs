//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, written through to a storage::Storage
//! what: LogEntry, RaftLog (entries, term/vote, commit index), log matching

use std::io;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::node::NodeId;
use crate::storage::Storage;

/// An election epoch. Never decreases on a node.
pub type Term = u64;

/// A log position. Starts at 1, 0 means "no entry".
pub type Index = u64;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: Index,
    /// The command to be applied to the state machine. Empty for the no-op
    /// a leader appends when it takes office.
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: Index, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

/// The local log store.
///
/// Keeps an in-memory mirror of the durable log together with the current
/// term, the vote cast in it and the commit index. Every mutation is written
/// to storage first and mirrored in memory only once the write succeeded, so
/// a failed write never leaves state that could be acknowledged.
///
/// Invariants:
///
/// * entry indexes are contiguous from 1
/// * entry terms never decrease along the log
/// * the term never decreases and a vote never changes within a term
/// * committed entries are never truncated
pub struct RaftLog {
    storage: Box<dyn Storage>,
    entries: Vec<LogEntry>,
    term: Term,
    voted_for: Option<NodeId>,
    commit_index: Index,
}

impl std::fmt::Debug for RaftLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftLog")
            .field("term", &self.term)
            .field("voted_for", &self.voted_for)
            .field("commit_index", &self.commit_index)
            .field("last_index", &self.last_index())
            .finish()
    }
}

impl RaftLog {
    /// Loads the log from storage (or starts empty on fresh storage).
    pub fn new(storage: Box<dyn Storage>) -> Result<Self> {
        let state = storage.load_state()?;
        if let Some((i, entry)) = state.log.iter().enumerate().find(|(i, e)| e.index != *i as Index + 1) {
            let msg = format!("persisted entry {} found at position {}", entry.index, i + 1);
            return Err(io::Error::new(io::ErrorKind::InvalidData, msg).into());
        }
        let last_index = state.log.last().map(|e| e.index).unwrap_or(0);
        // entries behind a persisted commit index may have been lost with an
        // unsynced tail; never claim more than we hold
        let commit_index = state.commit_index.min(last_index);
        debug!(term = state.term, last_index, commit_index, "loaded log");
        Ok(Self {
            storage,
            entries: state.log,
            term: state.term,
            voted_for: state.voted_for,
            commit_index,
        })
    }

    /// Returns the current term and the vote cast in it.
    pub fn term_vote(&self) -> (Term, Option<NodeId>) {
        (self.term, self.voted_for)
    }

    /// Durably records the current term and vote.
    pub fn set_term_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        assert!(term >= self.term, "term regression {} -> {}", self.term, term);
        assert!(
            term > self.term || self.voted_for.is_none() || voted_for == self.voted_for,
            "can't change vote within term {term}"
        );
        if term == self.term && voted_for == self.voted_for {
            return Ok(());
        }
        self.storage.persist_vote(term, voted_for)?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Rewrites the current term and vote. Used to probe whether storage
    /// accepts writes again after a failure.
    pub fn sync(&mut self) -> Result<()> {
        self.storage.persist_vote(self.term, self.voted_for)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> Index {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn last_index_and_term(&self) -> (Index, Term) {
        (self.last_index(), self.last_term())
    }

    /// Fetches the entry at an index, if present.
    pub fn get(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at an index, 0 if there is none.
    pub fn term_at(&self, index: Index) -> Term {
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    /// Whether the log holds an entry with this index and term. Index 0 is
    /// the empty prefix every log shares.
    pub fn has_entry(&self, index: Index, term: Term) -> bool {
        index == 0 || self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Entries with index in `from..=to`, clamped to what the log holds.
    pub fn range(&self, from: Index, to: Index) -> Vec<LogEntry> {
        let from = from.max(1);
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..to as usize].to_vec()
    }

    /// Appends entries that directly follow the current last entry.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        assert_eq!(first.index, self.last_index() + 1, "appended entries must follow the log");
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index && w[0].term <= w[1].term),
            "appended entries must be contiguous with non-decreasing terms"
        );
        assert!(first.term >= self.last_term(), "appended entry term regression");
        self.storage.append_entries(entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Appends a command in the current term and returns the new entry.
    pub fn append_command(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = LogEntry::new(self.term, self.last_index() + 1, command);
        self.append(std::slice::from_ref(&entry))?;
        Ok(entry)
    }

    /// Removes the entry at `index` and everything after it. Only ever used
    /// to resolve conflicts with a leader.
    pub fn truncate_from(&mut self, index: Index) -> Result<()> {
        assert!(index > self.commit_index, "can't truncate committed entry {index}");
        if index > self.last_index() {
            return Ok(());
        }
        self.storage.truncate_from(index)?;
        self.entries.truncate(index.saturating_sub(1) as usize);
        Ok(())
    }

    /// Splices entries following `prev_index` into the log. Entries already
    /// present with the same term are skipped; the first conflicting entry
    /// truncates the log from its index before the remainder is appended.
    /// Returns the index of the last spliced entry.
    pub fn splice(&mut self, prev_index: Index, entries: Vec<LogEntry>) -> Result<Index> {
        let last_new = prev_index + entries.len() as Index;
        let mut pending = entries.as_slice();
        while let Some(entry) = pending.first() {
            match self.get(entry.index) {
                Some(existing) if existing.term == entry.term => pending = &pending[1..],
                Some(_) => {
                    debug!(index = entry.index, "truncating conflicting log suffix");
                    self.truncate_from(entry.index)?;
                    break;
                }
                None => break,
            }
        }
        self.append(pending)?;
        Ok(last_new)
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Advances the commit index. Never moves backwards and never beyond the
    /// last entry. Returns whether it advanced.
    pub fn commit(&mut self, index: Index) -> Result<bool> {
        let index = index.min(self.last_index());
        if index <= self.commit_index {
            return Ok(false);
        }
        self.storage.persist_commit(index)?;
        self.commit_index = index;
        Ok(true)
    }

    /// Committed entries after `last_applied`, in index order.
    pub fn entries_to_apply(&self, last_applied: Index) -> Vec<LogEntry> {
        self.range(last_applied + 1, self.commit_index)
    }
}
