//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's Storage trait; handed to RaftNode at startup
//! what: FileStorage (atomic json files), StorageError, re-exports of the trait

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raft_core::{Index, LogEntry, NodeId, Term};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use raft_core::{MemoryStorage, PersistentState, Storage};

/// Ways the files on disk can disagree with what a raft log must be.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt state file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("log entry {found} does not follow entry {previous}")]
    Gap { previous: Index, found: Index },
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => e,
            e @ StorageError::Corrupt { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
            e @ StorageError::Gap { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
        }
    }
}

/// metadata structure for term, vote and commit index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
    #[serde(default)]
    commit_index: Index,
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term, voted_for and commit_index
/// - log.json: array of log entries
///
/// every write goes to a temp file which is synced and then renamed over the
/// old one, so a crash leaves either the old or the new file, never a torn
/// one. the log is mirrored in memory so appends don't re-read the file.
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    meta: MetaData,
    log: Vec<LogEntry>,
}

impl FileStorage {
    /// Opens the storage in a directory, creating it if it doesn't exist,
    /// and loads whatever state a previous run left there.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let meta: MetaData = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let log: Vec<LogEntry> = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();
        check_contiguous(0, &log)?;
        info!(dir = %dir.display(), term = meta.term, entries = log.len(), "opened file storage");
        Ok(Self { dir, meta, log })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn last_index(&self) -> Index {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    fn write_meta(&mut self, meta: MetaData) -> io::Result<()> {
        write_json_atomic(&self.dir, META_FILE, &meta)?;
        self.meta = meta;
        Ok(())
    }

    fn write_log(&mut self, log: Vec<LogEntry>) -> io::Result<()> {
        write_json_atomic(&self.dir, LOG_FILE, &log)?;
        self.log = log;
        Ok(())
    }
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

impl Storage for FileStorage {
    fn load_state(&self) -> io::Result<PersistentState> {
        Ok(PersistentState {
            term: self.meta.term,
            voted_for: self.meta.voted_for,
            commit_index: self.meta.commit_index,
            log: self.log.clone(),
        })
    }

    fn persist_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        self.write_meta(MetaData { term, voted_for, ..self.meta })
    }

    fn persist_commit(&mut self, commit_index: Index) -> io::Result<()> {
        self.write_meta(MetaData { commit_index, ..self.meta })
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.last_index(), entries)?;
        let mut log = self.log.clone();
        log.extend_from_slice(entries);
        self.write_log(log)
    }

    fn read_range(&self, from: Index, to: Index) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.iter().filter(|e| e.index >= from && e.index <= to).cloned().collect())
    }

    fn truncate_from(&mut self, index: Index) -> io::Result<()> {
        if index > self.last_index() {
            return Ok(());
        }
        let log = self.log.iter().filter(|e| e.index < index).cloned().collect();
        self.write_log(log)
    }
}

/// Entries must carry consecutive indexes directly after `previous`.
fn check_contiguous(previous: Index, entries: &[LogEntry]) -> Result<(), StorageError> {
    let mut previous = previous;
    for entry in entries {
        if entry.index != previous + 1 {
            return Err(StorageError::Gap { previous, found: entry.index });
        }
        previous = entry.index;
    }
    Ok(())
}

/// Reads a json file, or None if it doesn't exist.
fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StorageError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| StorageError::Corrupt { path: path.to_path_buf(), source })
}

/// atomic write: write to temp file, sync, then rename over the target
fn write_json_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    // the rename itself is only durable once the directory is synced
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    debug!(file = name, bytes = json.len(), "wrote state file");
    Ok(())
}
