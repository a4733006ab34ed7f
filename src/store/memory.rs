//! In-process request log store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{RequestLogStore, StoreError};

/// A request log store held in process memory.
///
/// Clones share the same underlying map, so a clone handed to a test can
/// inspect what the gate wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestLogStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut values = self.values.lock();
        let current = values.get(key).map(Vec::as_slice);

        if current != expected {
            trace!(key = %key, "Stored value changed since it was read");
            return Ok(false);
        }

        values.insert(key.to_string(), value.to_vec());
        Ok(true)
    }
}
