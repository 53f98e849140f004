// SPDX-License-Identifier: Apache-2.0

//! Tails log files on shared filesystems and publishes their lines with
//! at-least-once delivery. Read offsets survive restarts in a durable
//! registry and only advance once the sink has acknowledged the lines.

#[cfg(not(unix))]
compile_error!("efsbeat identifies files by device and inode and only builds on unix targets.");

pub mod bounded_channel;
pub mod error;
pub mod event;
pub mod harvester;
pub mod init;
pub mod metering;
pub mod outputs;
pub mod prospector;
pub mod publisher;
pub mod readiness;
pub mod registry;

#[cfg(test)]
mod testing;

pub use error::{BoxError, Error, Result};
pub use event::{Acknowledgement, Event, EventKind};
pub use publisher::{Batch, Pipeline, PipelineConfig, Publisher, Sink, SinkError};
pub use registry::{FileId, Registry};
