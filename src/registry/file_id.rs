// SPDX-License-Identifier: Apache-2.0

//! Filesystem identity of a file: device plus inode.
//!
//! The identity stays stable when a file is renamed, so it is what the
//! registry and the prospector key on. Paths are only bookkeeping.

use serde::{Deserialize, Serialize};
use std::fs::{File, Metadata};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Identity of an already opened handle. Unlike [`FileId::from_path`],
    /// this keeps answering for the same file after it has been renamed.
    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    /// Identity of whatever currently lives at `path`, without opening it.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Registry key, `"dev:ino"`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let (dev, ino) = key.split_once(':')?;
        Some(Self {
            dev: dev.parse().ok()?,
            ino: ino.parse().ok()?,
        })
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_same_file_same_id() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"test content").unwrap();

        let by_path = FileId::from_path(file.path()).unwrap();
        let by_handle = FileId::from_file(&file.reopen().unwrap()).unwrap();

        assert_eq!(by_path, by_handle);
    }

    #[test]
    fn test_different_files_differ() {
        let file1 = NamedTempFile::new().unwrap();
        let file2 = NamedTempFile::new().unwrap();

        assert_ne!(
            FileId::from_path(file1.path()).unwrap(),
            FileId::from_path(file2.path()).unwrap()
        );
    }

    #[test]
    fn test_stable_across_rename() {
        let dir = TempDir::new().unwrap();
        let before = dir.path().join("app.log");
        let after = dir.path().join("app.log.1");
        std::fs::write(&before, b"line\n").unwrap();

        let handle = File::open(&before).unwrap();
        let id = FileId::from_path(&before).unwrap();
        std::fs::rename(&before, &after).unwrap();

        assert_eq!(FileId::from_path(&after).unwrap(), id);
        assert_eq!(FileId::from_file(&handle).unwrap(), id);
    }

    #[test]
    fn test_key_roundtrip() {
        let id = FileId::new(123, 456);
        assert_eq!(id.key(), "123:456");
        assert_eq!(FileId::parse_key("123:456"), Some(id));
        assert_eq!(
            FileId::parse_key(&FileId::new(u64::MAX, 0).key()),
            Some(FileId::new(u64::MAX, 0))
        );
        assert_eq!(FileId::parse_key("123"), None);
        assert_eq!(FileId::parse_key("a:1"), None);
    }
}
