// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::file_id::FileId;
use super::fingerprint::Fingerprint;
use super::schema::{PersistedEntry, PersistedRegistry};
use super::store::JsonFileStore;
use crate::error::{Error, Result};

/// Last confirmed read position of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub identity: FileId,
    /// Byte offset just past the last acknowledged event
    pub offset: u64,
    /// False only when `offset` sits inside a line that was split because it
    /// exceeded the configured maximum line size
    pub line_terminated: bool,
    pub generation: u64,
    /// Leading bytes of the file this state belongs to
    pub fingerprint: Fingerprint,
    /// Last path the file was seen at
    pub path: PathBuf,
    pub updated_at: DateTime<Utc>,
}

impl ReadState {
    fn fresh(identity: FileId, path: PathBuf, fingerprint: Fingerprint) -> Self {
        Self {
            identity,
            offset: 0,
            line_terminated: true,
            generation: 0,
            fingerprint,
            path,
            updated_at: Utc::now(),
        }
    }

    fn from_persisted(entry: PersistedEntry) -> Self {
        Self {
            identity: entry.file_id(),
            offset: entry.offset,
            line_terminated: entry.line_terminated,
            generation: entry.generation,
            fingerprint: entry.fingerprint,
            path: PathBuf::from(entry.path),
            updated_at: entry.updated_at,
        }
    }

    fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            path: self.path.to_string_lossy().into_owned(),
            dev: self.identity.dev(),
            ino: self.identity.ino(),
            offset: self.offset,
            generation: self.generation,
            line_terminated: self.line_terminated,
            fingerprint: self.fingerprint.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The registry already holds a newer generation; nothing was written.
    Stale { current_generation: u64 },
}

/// Durable map from file identity to read state.
///
/// Every mutating call rewrites the backing file before it returns, and all
/// of them serialize on one lock. The in-memory map only takes a change once
/// it is on disk, so memory never runs ahead of the file. The calls do
/// blocking file I/O; async callers go through `spawn_blocking`.
#[derive(Debug)]
pub struct Registry {
    store: JsonFileStore,
    entries: Mutex<BTreeMap<FileId, ReadState>>,
}

type Entries = BTreeMap<FileId, ReadState>;

impl Registry {
    /// Load the registry at `path`. A corrupt file is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_store(JsonFileStore::new(path))
    }

    /// Registry that never touches disk.
    pub fn open_memory() -> Self {
        Self {
            store: JsonFileStore::memory(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_store(store: JsonFileStore) -> Result<Self> {
        let persisted = store.load()?;
        let entries: Entries = persisted
            .files
            .into_values()
            .map(|e| {
                let state = ReadState::from_persisted(e);
                (state.identity, state)
            })
            .collect();

        info!(
            path = ?store.path(),
            files = entries.len(),
            "Loaded registry"
        );

        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.store.path()
    }

    pub fn get(&self, identity: &FileId) -> Result<Option<ReadState>> {
        Ok(self.lock()?.get(identity).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Result<Vec<ReadState>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    /// Return the state a harvester should resume from, creating a fresh
    /// entry at offset 0 when the identity is unknown.
    ///
    /// `head` is the fingerprint of the file now at `identity`. When it does
    /// not continue the stored one, the inode was reused by another file:
    /// the entry starts a new generation at offset 0. Otherwise the stored
    /// fingerprint grows to `head` and the last known path is refreshed.
    pub fn begin(&self, identity: FileId, path: &Path, head: &Fingerprint) -> Result<ReadState> {
        let mut entries = self.lock()?;

        let state = match entries.get(&identity) {
            None => ReadState::fresh(identity, path.to_path_buf(), head.clone()),
            Some(existing) if !head.continues(&existing.fingerprint) => {
                info!(
                    %identity,
                    old_path = ?existing.path,
                    new_path = ?path,
                    stale_offset = existing.offset,
                    "File identity reused by a different file, reading it from the start"
                );
                let mut state = ReadState::fresh(identity, path.to_path_buf(), head.clone());
                state.generation = existing.generation + 1;
                state
            }
            Some(existing) => {
                if existing.path == path && existing.fingerprint.len() >= head.len() {
                    return Ok(existing.clone());
                }
                if existing.path != path {
                    debug!(
                        %identity,
                        old_path = ?existing.path,
                        new_path = ?path,
                        "Known file seen at new path"
                    );
                }
                let mut state = existing.clone();
                state.path = path.to_path_buf();
                if head.len() > state.fingerprint.len() {
                    state.fingerprint = head.clone();
                }
                state
            }
        };

        self.apply(&mut entries, state.clone())?;
        Ok(state)
    }

    /// Record an acknowledged position.
    ///
    /// Within one generation the stored offset never moves backwards; a lower
    /// offset is accepted without changing anything. A caller holding an
    /// older generation than the stored one gets [`CommitOutcome::Stale`].
    pub fn commit(
        &self,
        identity: FileId,
        generation: u64,
        offset: u64,
        line_terminated: bool,
    ) -> Result<CommitOutcome> {
        let mut entries = self.lock()?;

        let mut state = match entries.get(&identity) {
            Some(existing) if existing.generation > generation => {
                return Ok(CommitOutcome::Stale {
                    current_generation: existing.generation,
                });
            }
            Some(existing) if existing.generation == generation && existing.offset >= offset => {
                return Ok(CommitOutcome::Committed);
            }
            Some(existing) => {
                let mut state = existing.clone();
                if state.generation != generation {
                    // Content of an older generation says nothing about this one
                    state.fingerprint = Fingerprint::default();
                }
                state
            }
            None => ReadState::fresh(identity, PathBuf::new(), Fingerprint::default()),
        };
        state.generation = generation;
        state.offset = offset;
        state.line_terminated = line_terminated;
        state.updated_at = Utc::now();

        self.apply(&mut entries, state)?;
        Ok(CommitOutcome::Committed)
    }

    /// Start a new generation at offset 0 after truncation. The new
    /// generation is strictly greater than both the stored one and the one
    /// the caller observed. The fingerprint is cleared; the truncated file's
    /// new content fills it in again.
    pub fn advance_generation(&self, identity: FileId, observed: u64) -> Result<ReadState> {
        let mut entries = self.lock()?;

        let mut state = match entries.get(&identity) {
            Some(existing) => existing.clone(),
            None => ReadState::fresh(identity, PathBuf::new(), Fingerprint::default()),
        };
        state.generation = state.generation.max(observed) + 1;
        state.offset = 0;
        state.line_terminated = true;
        state.fingerprint = Fingerprint::default();
        state.updated_at = Utc::now();

        self.apply(&mut entries, state.clone())?;
        Ok(state)
    }

    /// Grow the stored fingerprint of `generation` to `head` when `head`
    /// continues it. Returns the fingerprint stored afterwards.
    pub fn extend_fingerprint(
        &self,
        identity: FileId,
        generation: u64,
        head: &Fingerprint,
    ) -> Result<Fingerprint> {
        let mut entries = self.lock()?;

        let Some(existing) = entries.get(&identity) else {
            return Ok(Fingerprint::default());
        };
        if existing.generation != generation
            || head.len() <= existing.fingerprint.len()
            || !head.continues(&existing.fingerprint)
        {
            return Ok(existing.fingerprint.clone());
        }

        let mut state = existing.clone();
        state.fingerprint = head.clone();
        self.apply(&mut entries, state)?;
        Ok(head.clone())
    }

    /// Explicit cleanup pass: drop every entry for which `keep` returns
    /// false. Returns how many were removed.
    pub fn retain<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&ReadState) -> bool,
    {
        let mut entries = self.lock()?;
        let removed: Vec<FileId> = entries
            .values()
            .filter(|state| !keep(state))
            .map(|state| state.identity)
            .collect();

        if removed.is_empty() {
            return Ok(0);
        }

        let mut snapshot = Self::snapshot(&entries);
        for id in &removed {
            snapshot.files.remove(&id.key());
        }
        self.store.write(&snapshot)?;

        for id in &removed {
            entries.remove(id);
        }
        Ok(removed.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| Error::Persistence("registry lock poisoned".to_string()))
    }

    /// Write the registry with `state` in place, then take it into memory.
    fn apply(&self, entries: &mut Entries, state: ReadState) -> Result<()> {
        let mut snapshot = Self::snapshot(entries);
        snapshot
            .files
            .insert(state.identity.key(), state.to_persisted());
        self.store.write(&snapshot)?;

        entries.insert(state.identity, state);
        Ok(())
    }

    fn snapshot(entries: &Entries) -> PersistedRegistry {
        let mut snapshot = PersistedRegistry::default();
        for (id, state) in entries {
            snapshot.files.insert(id.key(), state.to_persisted());
        }
        snapshot
    }
}
