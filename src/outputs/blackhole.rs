// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use crate::publisher::{Batch, Sink, SinkError};

/// Accepts and discards every batch.
#[derive(Debug, Default)]
pub struct BlackholeSink {
    events: AtomicU64,
}

impl BlackholeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events discarded so far
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

impl Sink for BlackholeSink {
    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        self.events.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "blackhole"
    }
}
