// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event::Event;
use crate::publisher::{Batch, Sink, SinkError};

/// Keeps every delivered event. Fails the first `fail_first` sends.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    delivered: Arc<Mutex<Vec<Event>>>,
    attempts: Arc<AtomicU32>,
    fail_first: Arc<AtomicU32>,
}

impl RecordingSink {
    pub(crate) fn failing_first(n: u32) -> Self {
        Self {
            fail_first: Arc::new(AtomicU32::new(n)),
            ..Default::default()
        }
    }

    pub(crate) fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn payloads(&self) -> Vec<String> {
        self.delivered()
            .iter()
            .map(|e| String::from_utf8_lossy(&e.payload).into_owned())
            .collect()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Sink for RecordingSink {
    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable(format!("failure {}", attempt + 1)));
        }
        self.delivered
            .lock()
            .unwrap()
            .extend(batch.events().iter().cloned());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Poll `cond` until it holds, panicking after `timeout`.
pub(crate) async fn wait_for<F>(timeout: Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
