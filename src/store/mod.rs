//! Request log storage.
//!
//! The request log lives under a single well-known key in a key-value store
//! shared by every gate instance. Backends expose plain `GET`/`SET` plus a
//! compare-and-swap so the gate can update the log atomically.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errors raised by a request log store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused or dropped the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Redis client errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key-value storage for the serialized request log.
///
/// Values are opaque bytes; encoding and decoding belong to the caller.
#[async_trait]
pub trait RequestLogStore: Send + Sync + std::fmt::Debug {
    /// Fetch the raw value stored under `key`, `None` when absent.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditionally overwrite the value stored under `key`.
    ///
    /// The gate never calls this; it is for seeding a log and for operator
    /// repairs such as replacing a corrupt value or resetting the window.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Write `value` only if the stored value still equals `expected`.
    ///
    /// `expected = None` requires the key to be absent. Returns `Ok(false)`
    /// when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, StoreError>;
}
