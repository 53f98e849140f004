// SPDX-License-Identifier: Apache-2.0

//! JSON file storage for the registry with atomic replace-on-write.
//!
//! Every write goes to a unique temp file in the same directory, is flushed
//! and fsynced, then renamed over the registry file; the directory is fsynced
//! afterwards so the rename itself survives a crash. Readers therefore only
//! ever see a complete old snapshot or a complete new one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::schema::{PersistedRegistry, REGISTRY_VERSION};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    /// `None` keeps everything in memory (tests)
    path: Option<PathBuf>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the last durable snapshot.
    ///
    /// A missing file is an empty registry. Anything else that prevents a
    /// clean read is reported as [`Error::RegistryCorrupt`].
    pub fn load(&self) -> Result<PersistedRegistry> {
        let Some(path) = &self.path else {
            return Ok(PersistedRegistry::default());
        };

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                ensure_parent_dir(path)?;
                debug!(path = ?path, "No registry file found, starting with empty registry");
                return Ok(PersistedRegistry::default());
            }
            Err(e) => {
                return Err(Error::RegistryCorrupt {
                    path: path.clone(),
                    reason: format!("cannot open: {}", e),
                });
            }
        };

        let state: PersistedRegistry = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::RegistryCorrupt {
                path: path.clone(),
                reason: format!("cannot parse: {}", e),
            })?;

        if state.version != REGISTRY_VERSION {
            return Err(Error::RegistryCorrupt {
                path: path.clone(),
                reason: format!("unsupported schema version {}", state.version),
            });
        }

        for (key, entry) in &state.files {
            if entry.file_id().key() != *key {
                return Err(Error::RegistryCorrupt {
                    path: path.clone(),
                    reason: format!("entry {} does not match its identity {}", key, entry.file_id()),
                });
            }
        }

        Ok(state)
    }

    pub fn write(&self, state: &PersistedRegistry) -> Result<()> {
        match &self.path {
            Some(path) => atomic_write(path, state),
            None => Ok(()),
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create registry directory: {}", e))
            })?;
        }
    }
    Ok(())
}

/// Write state to file atomically (write to temp, fsync, rename, fsync dir)
fn atomic_write(path: &Path, state: &PersistedRegistry) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    ensure_parent_dir(path)?;

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let result = write_temp(&temp_path, state).and_then(|()| {
        fs::rename(&temp_path, path)
            .map_err(|e| Error::Persistence(format!("failed to rename registry file: {}", e)))
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    sync_parent_dir(path);
    Ok(())
}

fn write_temp(temp_path: &Path, state: &PersistedRegistry) -> Result<()> {
    let file = File::create(temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state)?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush registry: {}", e)))?;

    let file = writer
        .into_inner()
        .map_err(|e| Error::Persistence(format!("failed to flush registry: {}", e.error())))?;
    file.sync_all()
        .map_err(|e| Error::Persistence(format!("failed to sync registry: {}", e)))?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    // Some network filesystems refuse fsync on directories; the rename has
    // already happened so this is best effort.
    if let Err(e) = File::open(parent).and_then(|d| d.sync_all()) {
        debug!(dir = ?parent, error = %e, "Directory sync after registry write failed");
    }
}
