// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total sends of one batch, the first attempt included
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max attempts must be at least 1".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "retry initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: self.initial_backoff,
            max: self.max_backoff,
        }
    }
}

/// Exponential backoff with random jitter around the current delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Delay before the next attempt. Each call doubles the base delay,
    /// capped at the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let backoff_ms = self.current.as_millis() as i64;

        let mut v = backoff_ms / 2;
        // avoid div by zero
        if v == 0 {
            v = 1;
        }

        let jitter = (rand::random::<i64>() % v) - (v / 2);
        let mut sleep_ms = backoff_ms + jitter;
        if sleep_ms < 0 {
            sleep_ms = 1;
        }

        self.current = std::cmp::min(self.current * 2, self.max);
        Duration::from_millis(sleep_ms as u64)
    }
}
