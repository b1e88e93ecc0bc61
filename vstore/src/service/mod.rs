//! Storage orchestrator
//!
//! [`StorageService`] is the only layer with business rules. It validates
//! paths, takes advisory path locks, sequences metadata and backstore calls
//! and maps their failures onto [`crate::error::StorageError`].
//!
//! Submodules:
//! - `storage`: the service handle, lookups, listing, folders, downloads, delete
//! - `transfer`: copy and move (with merge) as iterative worklists
//! - `upload`: the chunked upload state machine and sidecars

mod storage;
mod transfer;
mod upload;

pub use storage::StorageService;
