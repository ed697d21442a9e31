//! Key Store - durable name → bytes mapping with per-key optimistic concurrency.
//!
//! The signing core never locks in-process. Every mutation is expressed as one
//! of the two conditional primitives below, so serializability per key comes
//! from the store itself even when many independent instances share it.
//!
//! | Operation | Success | Failure |
//! |-----------|---------|---------|
//! | `create_if_absent` | new version (1) | `AlreadyExists` |
//! | `read` | `(bytes, version)` | `NotFound` |
//! | `write_if_version` | next version | `Conflict` |

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use thiserror::Error;

/// Concurrency token. Starts at 1, bumped by every successful write.
pub type Version = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record named {0}")]
    NotFound(String),

    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("record {name} changed since version {expected}")]
    Conflict { name: String, expected: Version },

    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub bytes: Vec<u8>,
    pub version: Version,
}

pub trait KeyStore: Send + Sync {
    /// Store `bytes` under `name` only if nothing is stored there yet.
    fn create_if_absent(&self, name: &str, bytes: &[u8]) -> StoreResult<Version>;

    fn read(&self, name: &str) -> StoreResult<Versioned>;

    /// Replace the value only if the current version still equals `expected`.
    fn write_if_version(&self, name: &str, bytes: &[u8], expected: Version) -> StoreResult<Version>;
}

impl<T: KeyStore + ?Sized> KeyStore for std::sync::Arc<T> {
    fn create_if_absent(&self, name: &str, bytes: &[u8]) -> StoreResult<Version> {
        (**self).create_if_absent(name, bytes)
    }

    fn read(&self, name: &str) -> StoreResult<Versioned> {
        (**self).read(name)
    }

    fn write_if_version(&self, name: &str, bytes: &[u8], expected: Version) -> StoreResult<Version> {
        (**self).write_if_version(name, bytes, expected)
    }
}
