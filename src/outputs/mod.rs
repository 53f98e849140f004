// SPDX-License-Identifier: Apache-2.0

//! Concrete sinks the agent can publish to.

mod blackhole;
mod ndjson;

pub use blackhole::BlackholeSink;
pub use ndjson::NdjsonSink;

use crate::publisher::{Batch, Sink, SinkError};

/// The output selected at startup.
pub enum Output {
    Ndjson(NdjsonSink),
    Blackhole(BlackholeSink),
}

impl Sink for Output {
    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        match self {
            Output::Ndjson(sink) => sink.send(batch).await,
            Output::Blackhole(sink) => sink.send(batch).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Output::Ndjson(sink) => sink.name(),
            Output::Blackhole(sink) => sink.name(),
        }
    }
}
