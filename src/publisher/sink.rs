// SPDX-License-Identifier: Apache-2.0

use std::future::Future;

use thiserror::Error;

use super::batch::Batch;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink did not answer before the shutdown deadline")]
    Timeout,
}

/// Destination for batches.
///
/// `send` resolves once the whole batch is durably handed off; an `Err`
/// means nothing of the batch may be considered delivered. The same batch
/// can be offered again on retry.
pub trait Sink: Send + Sync + 'static {
    fn send(&self, batch: &Batch) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn name(&self) -> &'static str;
}
