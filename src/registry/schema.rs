// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of the registry.
//!
//! ```json
//! {
//!   "version": 1,
//!   "files": {
//!     "2049:1311": {
//!       "path": "/mnt/efs/app/app.log",
//!       "dev": 2049, "ino": 1311,
//!       "offset": 4096, "generation": 0, "line_terminated": true,
//!       "fingerprint": "MjAyNC0wNS0wMSBzdGFydGluZwo=",
//!       "updated_at": "2024-05-01T10:00:00Z"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file_id::FileId;
use super::fingerprint::Fingerprint;

/// Current schema version for the persisted registry
pub const REGISTRY_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRegistry {
    pub version: u8,
    /// Keyed by `"dev:ino"`. A BTreeMap keeps the file diff-friendly.
    pub files: BTreeMap<String, PersistedEntry>,
}

impl Default for PersistedRegistry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            files: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Last path the file was seen at, for operators reading the file
    pub path: String,
    pub dev: u64,
    pub ino: u64,
    pub offset: u64,
    pub generation: u64,
    pub line_terminated: bool,
    /// Base64 of the leading bytes; absent in files written before it existed
    #[serde(default)]
    pub fingerprint: Fingerprint,
    pub updated_at: DateTime<Utc>,
}

impl PersistedEntry {
    pub fn file_id(&self) -> FileId {
        FileId::new(self.dev, self.ino)
    }
}
