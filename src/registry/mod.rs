// SPDX-License-Identifier: Apache-2.0

//! Durable record of how far each file has been read and acknowledged.

mod file_id;
mod fingerprint;
mod offset_registry;
mod schema;
mod store;

pub use file_id::FileId;
pub use fingerprint::Fingerprint;
pub use offset_registry::{CommitOutcome, ReadState, Registry};
pub use schema::{PersistedEntry, PersistedRegistry, REGISTRY_VERSION};
