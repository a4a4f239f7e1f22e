//! Durable key-value storage contract.
//!
//! Every worker owns one namespace (`stage_replica`). No cross-key
//! transactions are assumed; callers sequence single-key writes.

mod http;
mod memory;
mod surreal;

use async_trait::async_trait;
use tracing::debug;

pub use http::HttpKvStore;
pub use memory::InMemoryKvStore;
pub use surreal::{Credentials, StoreConfig, SurrealKvStore};

use crate::Result;

/// Namespaced byte storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the write is not acknowledged.
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read the value under `key`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the read cannot be served.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the delete is not acknowledged.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Store wrapper that logs every operation.
pub struct TracingKvStore<S> {
    inner: S,
}

impl<S: KeyValueStore> TracingKvStore<S> {
    /// Wrap a store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Get the wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for TracingKvStore<S> {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let size = value.len();
        let result = self.inner.put(namespace, key, value).await;
        debug!(namespace, key, size, ok = result.is_ok(), "kv put");
        result
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self.inner.get(namespace, key).await;
        debug!(
            namespace,
            key,
            found = matches!(result, Ok(Some(_))),
            ok = result.is_ok(),
            "kv get"
        );
        result
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let result = self.inner.delete(namespace, key).await;
        debug!(namespace, key, ok = result.is_ok(), "kv delete");
        result
    }
}
