// SPDX-License-Identifier: Apache-2.0

//! Per-file tailing task.
//!
//! A harvester reads new lines from one open file handle, hands them to the
//! publisher pipeline and commits offsets to the registry only when the
//! pipeline acknowledges delivery.

mod reader;
mod state;
mod tailer;

use std::time::Duration;

use crate::error::{Error, Result};

pub use reader::{Line, LineReader, ReadOutcome};
pub use state::{Directive, HarvesterState, HarvesterStatus};
pub use tailer::{Harvester, HarvesterControl};

#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// How often the open handle is compared with the path for truncation
    /// and rotation while data keeps arriving
    pub check_interval: Duration,
    /// First wait at end of file or after a read error
    pub backoff: Duration,
    /// Cap for the wait, which doubles while nothing happens
    pub max_backoff: Duration,
    /// How long a finishing harvester waits for outstanding acknowledgments
    pub close_timeout: Duration,
    pub read_buffer_bytes: usize,
    /// Longer lines are emitted in pieces of this size
    pub max_line_bytes: usize,
    pub ack_capacity: usize,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            read_buffer_bytes: 16 * 1024,
            max_line_bytes: 10 * 1024 * 1024,
            ack_capacity: 128,
        }
    }
}

impl HarvesterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_bytes == 0 {
            return Err(Error::Config("read buffer size must be at least 1 byte".into()));
        }
        if self.max_line_bytes == 0 {
            return Err(Error::Config("max line size must be at least 1 byte".into()));
        }
        if self.backoff.is_zero() || self.backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "harvester backoff {:?} must be non-zero and at most max backoff {:?}",
                self.backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}
