// SPDX-License-Identifier: Apache-2.0

mod batch;
mod pipeline;
mod retry;
mod sink;

pub use batch::Batch;
pub use pipeline::{
    Pipeline, PipelineConfig, PipelineCounters, PipelineStats, Publisher, Rejected,
};
pub use retry::{Backoff, RetryConfig};
pub use sink::{Sink, SinkError};
