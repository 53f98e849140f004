// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use clap::Args;

use crate::init::retry::RetryArgs;
use crate::publisher::PipelineConfig;

// Batch settings
#[derive(Debug, Clone, Args)]
pub struct BatchArgs {
    /// Batch size in number of events
    #[arg(long, env = "EFSBEAT_BATCH_MAX_EVENTS", default_value = "2048")]
    pub batch_max_events: usize,

    /// Batch size in payload bytes
    #[arg(long, env = "EFSBEAT_BATCH_MAX_BYTES", default_value = "4194304")]
    pub batch_max_bytes: usize,

    /// Longest a partial batch waits for more events
    #[arg(long, env = "EFSBEAT_BATCH_TIMEOUT", default_value = "1s")]
    pub batch_timeout: humantime::Duration,

    /// Events the pipeline buffers before harvesters stall
    #[arg(long, env = "EFSBEAT_INGRESS_CAPACITY", default_value = "4096")]
    pub ingress_capacity: usize,
}

impl Default for BatchArgs {
    fn default() -> Self {
        let config = PipelineConfig::default();
        Self {
            batch_max_events: config.max_events,
            batch_max_bytes: config.max_bytes,
            batch_timeout: config.max_linger.into(),
            ingress_capacity: config.ingress_capacity,
        }
    }
}

pub fn build_pipeline_config(
    batch: &BatchArgs,
    retry: &RetryArgs,
    shutdown_grace: Duration,
) -> PipelineConfig {
    PipelineConfig {
        max_events: batch.batch_max_events,
        max_bytes: batch.batch_max_bytes,
        max_linger: batch.batch_timeout.into(),
        ingress_capacity: batch.ingress_capacity,
        retry: retry.into(),
        shutdown_grace,
    }
}
