// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The durable registry exists but cannot be read back. Fatal at startup.
    #[error("registry at {path:?} is corrupt: {reason}. Remove or repair it before restarting")]
    RegistryCorrupt { path: PathBuf, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used at task and process boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
