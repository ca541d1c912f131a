//! Stable storage for the durable part of a node's state.
//!
//! The engine serializes `(current_term, voted_for, log)` into one opaque
//! blob and hands it to a [`Persister`]. The write must be atomic and
//! durable before the engine sends any reply that depends on the new state;
//! implementations that buffer or reorder writes would let a restarted node
//! vote twice in a term or forget acknowledged entries.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Entry, LogIndex, PeerId, Term};

/// Atomic byte-blob stable storage.
pub trait Persister: Send + Sync {
    /// Durably replace the stored blob. All-or-nothing.
    fn save(&self, state: &[u8]) -> io::Result<()>;

    /// Return the stored blob, or an empty vector if nothing was ever saved.
    fn load(&self) -> io::Result<Vec<u8>>;
}

/// Durable fields, as they appear in the persisted blob.
#[derive(Deserialize)]
pub struct HardState<Cmd> {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub log: Vec<Entry<Cmd>>,
}

#[derive(Serialize)]
struct HardStateRef<'a, Cmd> {
    current_term: Term,
    voted_for: Option<PeerId>,
    log: &'a [Entry<Cmd>],
}

/// Serialize the durable fields without cloning the log.
pub fn encode_hard_state<Cmd: Serialize>(
    current_term: Term,
    voted_for: Option<PeerId>,
    log: &[Entry<Cmd>],
) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&HardStateRef {
        current_term,
        voted_for,
        log,
    })
}

pub fn decode_hard_state<Cmd: DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<HardState<Cmd>> {
    serde_json::from_slice(bytes)
}

/// Validate the shape of a restored log: non-empty, sentinel at 0, dense
/// indices, non-decreasing terms.
pub fn check_restored_log<Cmd>(log: &[Entry<Cmd>]) -> crate::error::Result<()> {
    use crate::error::Error;

    let Some(first) = log.first() else {
        return Err(Error::InvalidState("restored log is empty"));
    };
    if first.index != LogIndex::ZERO || first.term != Term::ZERO {
        return Err(Error::InvalidState("restored log lacks the sentinel entry"));
    }
    for (i, pair) in log.windows(2).enumerate() {
        if pair[1].index.as_usize() != i + 1 {
            return Err(Error::InvalidState("restored log indices are not dense"));
        }
        if pair[1].term < pair[0].term {
            return Err(Error::InvalidState("restored log terms decrease"));
        }
    }
    Ok(())
}

/// In-memory persister. Survives engine restarts as long as the caller keeps
/// the same instance around, which is exactly what crash/recovery tests need.
#[derive(Default)]
pub struct MemoryPersister {
    state: Mutex<Vec<u8>>,
}

impl MemoryPersister {
    pub fn new() -> MemoryPersister {
        MemoryPersister::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: &[u8]) -> io::Result<()> {
        let mut slot = self.state.lock().unwrap_or_else(|e| e.into_inner());
        slot.clear();
        slot.extend_from_slice(state);
        Ok(())
    }

    fn load(&self) -> io::Result<Vec<u8>> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Disk-backed persister. The blob lives in one file inside `dir`, replaced
/// atomically on every save: write temp file, fsync, rename over the old
/// blob, fsync the directory so the rename survives a crash.
///
/// The engine calls `save` with its state lock held, so on a disk-backed
/// node every vote and append reply waits out these fsyncs before it can
/// leave. The write must land before the reply does, which puts the fsync
/// latency squarely on the RPC path; keep the data directory on fast
/// storage.
pub struct FilePersister {
    dir: PathBuf,
}

const STATE_FILE: &str = "state.json";

impl FilePersister {
    /// Open (or create) storage rooted at `dir`.
    pub fn open(dir: &Path) -> io::Result<FilePersister> {
        fs::create_dir_all(dir)?;
        Ok(FilePersister {
            dir: dir.to_path_buf(),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

impl Persister for FilePersister {
    fn save(&self, state: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join("state.json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(state)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.state_path())?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn load(&self) -> io::Result<Vec<u8>> {
        match fs::read(self.state_path()) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
