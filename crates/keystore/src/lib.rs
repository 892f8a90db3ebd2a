//! Durable storage for the gateway's API key pool
//!
//! The store owns every persisted fact about the pool: one `KeyRecord` per
//! credential plus the rotation cursor. It exposes conditional writes
//! (`conditional_update_last_used`, `advance_cursor`) so that several gateway
//! replicas can rotate through the same pool without an in-process lock.
//!
//! Two backends ship with the crate:
//! - `MemoryKeyStore`: process-local, for tests and single-instance use
//! - `FileKeyStore`: JSON file with atomic temp-file + rename writes

pub mod error;
pub mod file;
pub mod memory;
pub mod record;
mod state;
pub mod store;

#[cfg(test)]
mod conformance;

pub use error::{Error, Result};
pub use file::FileKeyStore;
pub use memory::MemoryKeyStore;
pub use record::{KeyId, KeyRecord};
pub use store::{KeyStore, StoreFuture};
