// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;

use crate::registry::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterState {
    Starting,
    Reading,
    /// The path now points at another file, or nothing. The old handle is
    /// read to its end before the harvester exits.
    Rotated,
    /// Transient: the file shrank below the read position and reading
    /// restarts at 0 in a new generation.
    Truncated,
    Stopped,
    /// The file could not be opened.
    Failed,
}

impl fmt::Display for HarvesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarvesterState::Starting => "starting",
            HarvesterState::Reading => "reading",
            HarvesterState::Rotated => "rotated",
            HarvesterState::Truncated => "truncated",
            HarvesterState::Stopped => "stopped",
            HarvesterState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the prospector wants a harvester to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Directive {
    Run,
    /// Read to the end of the file, then finish.
    Drain,
    /// Stop reading and wait for outstanding acknowledgments.
    Finish,
    /// Exit now. Unacknowledged events are re-read on a later start.
    Abort,
}

/// Progress a harvester publishes for its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvesterStatus {
    pub path: PathBuf,
    /// Unknown until the file has been opened
    pub identity: Option<FileId>,
    pub state: HarvesterState,
    pub generation: u64,
    pub committed_offset: u64,
}

impl HarvesterStatus {
    pub fn starting(path: PathBuf, identity: Option<FileId>) -> Self {
        Self {
            path,
            identity,
            state: HarvesterState::Starting,
            generation: 0,
            committed_offset: 0,
        }
    }
}
