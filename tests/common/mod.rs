// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use efsbeat::init::args::AgentRun;
use efsbeat::init::batch::BatchArgs;
use efsbeat::init::retry::RetryArgs;
use efsbeat::{Batch, Event, Sink, SinkError};

/// Records every send attempt and every delivered event. The first
/// `fail_first` sends fail.
#[derive(Clone, Default)]
pub struct RecordingSink {
    delivered: Arc<Mutex<Vec<Event>>>,
    attempts: Arc<Mutex<Vec<Vec<String>>>>,
    fail_first: Arc<AtomicU32>,
}

impl RecordingSink {
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: Arc::new(AtomicU32::new(n)),
            ..Default::default()
        }
    }

    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.delivered()
            .iter()
            .map(|e| String::from_utf8_lossy(&e.payload).into_owned())
            .collect()
    }

    /// Payloads of every batch handed to the sink, failed sends included
    pub fn attempts(&self) -> Vec<Vec<String>> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        let payloads = batch
            .events()
            .iter()
            .map(|e| String::from_utf8_lossy(&e.payload).into_owned())
            .collect();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(payloads);
            attempts.len() as u32
        };

        if attempt <= self.fail_first.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable(format!("refused attempt {}", attempt)));
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

/// Agent settings with intervals short enough for tests.
pub fn fast_agent(dir: &Path) -> AgentRun {
    AgentRun {
        include: vec![format!("{}/*.log", dir.display())],
        registry_path: dir.join("data").join("registry.json"),
        scan_interval: Duration::from_millis(50),
        check_interval: Duration::from_millis(50),
        backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        close_timeout: Duration::from_secs(2),
        batch: BatchArgs {
            batch_timeout: Duration::from_millis(10).into(),
            ..Default::default()
        },
        retry: RetryArgs {
            retry_initial_backoff: Duration::from_millis(10),
            retry_max_backoff: Duration::from_millis(50),
            ..Default::default()
        },
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Poll `cond` until it holds, panicking after `timeout`.
pub async fn wait_for<F>(timeout: Duration, mut cond: F)
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
