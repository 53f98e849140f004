// SPDX-License-Identifier: Apache-2.0

//! Leading bytes of a file, kept next to its identity.
//!
//! Inode numbers are reused once a file is deleted, so `(dev, ino)` alone can
//! point a new file at an old read state. The head of the file tells them
//! apart: a file only ever grows behind its head, so a later head always
//! starts with an earlier one unless the file was replaced or rewritten.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How many leading bytes are compared.
pub const FINGERPRINT_BYTES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    head: Vec<u8>,
}

impl Fingerprint {
    /// Read up to [`FINGERPRINT_BYTES`] from the start of `file` without
    /// moving any read position.
    pub fn read(file: &File) -> io::Result<Self> {
        let mut head = vec![0u8; FINGERPRINT_BYTES];
        let mut filled = 0;
        while filled < head.len() {
            match file.read_at(&mut head[filled..], filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        head.truncate(filled);
        Ok(Self { head })
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(FINGERPRINT_BYTES);
        Self { head: bytes }
    }

    pub fn len(&self) -> usize {
        self.head.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// No more bytes will be added.
    pub fn is_complete(&self) -> bool {
        self.head.len() >= FINGERPRINT_BYTES
    }

    /// Whether a file with this head can be the one `earlier` was taken
    /// from. An empty `earlier` matches anything.
    pub fn continues(&self, earlier: &Fingerprint) -> bool {
        self.head.starts_with(&earlier.head)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.head))
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let head = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        if head.len() > FINGERPRINT_BYTES {
            return Err(serde::de::Error::custom(format!(
                "fingerprint of {} bytes exceeds {}",
                head.len(),
                FINGERPRINT_BYTES
            )));
        }
        Ok(Self { head })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_short_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let fp = Fingerprint::read(file.as_file()).unwrap();
        assert_eq!(fp, Fingerprint::from_bytes(b"hello world".to_vec()));
        assert!(!fp.is_complete());
    }

    #[test]
    fn test_read_stops_at_limit() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[b'x'; 200]).unwrap();

        let fp = Fingerprint::read(file.as_file()).unwrap();
        assert_eq!(fp.len(), FINGERPRINT_BYTES);
        assert!(fp.is_complete());
    }

    #[test]
    fn test_continues() {
        let grown = Fingerprint::from_bytes(b"hello world".to_vec());
        let early = Fingerprint::from_bytes(b"hello".to_vec());
        let other = Fingerprint::from_bytes(b"world".to_vec());

        assert!(grown.continues(&early));
        assert!(!early.continues(&grown));
        assert!(!grown.continues(&other));
        assert!(grown.continues(&Fingerprint::default()));
    }

    #[test]
    fn test_serialized_as_base64() {
        let fp = Fingerprint::from_bytes(b"line1\n".to_vec());
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"bGluZTEK\"");
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), fp);

        let too_long = format!("\"{}\"", STANDARD.encode([0u8; FINGERPRINT_BYTES + 1]));
        assert!(serde_json::from_str::<Fingerprint>(&too_long).is_err());
        assert!(serde_json::from_str::<Fingerprint>("\"not base64!\"").is_err());
    }
}
