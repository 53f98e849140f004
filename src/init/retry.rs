// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use clap::Args;

use crate::publisher::RetryConfig;

/// Retry of batches the sink refused
#[derive(Debug, Clone, Args)]
pub struct RetryArgs {
    /// Delay before the first resend of a failed batch
    #[arg(
        long,
        env = "EFSBEAT_RETRY_INITIAL_BACKOFF",
        default_value = "500ms",
        value_parser = humantime::parse_duration,
    )]
    pub retry_initial_backoff: Duration,

    /// Upper bound for the doubling resend delay
    #[arg(
        long,
        env = "EFSBEAT_RETRY_MAX_BACKOFF",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub retry_max_backoff: Duration,

    /// Sends of one batch before its events are handed back for re-reading
    #[arg(long, env = "EFSBEAT_RETRY_MAX_ATTEMPTS", default_value = "10")]
    pub retry_max_attempts: u32,
}

impl Default for RetryArgs {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            retry_initial_backoff: config.initial_backoff,
            retry_max_backoff: config.max_backoff,
            retry_max_attempts: config.max_attempts,
        }
    }
}

impl From<&RetryArgs> for RetryConfig {
    fn from(args: &RetryArgs) -> Self {
        RetryConfig {
            initial_backoff: args.retry_initial_backoff,
            max_backoff: args.retry_max_backoff,
            max_attempts: args.retry_max_attempts,
        }
    }
}
