//! Durable per-key storage for mirrored state values.
//!
//! The browser build keeps a handful of state keys in `localStorage`.
//! This crate provides the same shape on the Rust side: a flat string key
//! space holding opaque byte values, with an in-memory implementation for
//! tests and ephemeral sessions and a redb-backed one for real persistence.

pub mod error;
pub mod memory;
pub mod redb;
pub mod traits;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use redb::RedbStorage;
pub use traits::KeyValueStorage;
