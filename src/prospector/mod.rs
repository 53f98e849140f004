// SPDX-License-Identifier: Apache-2.0

//! Maps configured glob patterns to running harvesters.

mod finder;
mod handle;
mod scanner;

pub use finder::{FileFinder, GlobFileFinder};
pub use handle::HarvesterHandle;
pub use scanner::{Prospector, ProspectorConfig, ProspectorStats};

#[cfg(test)]
pub(crate) use finder::mock::MockFileFinder;
