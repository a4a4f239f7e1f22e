//! In-memory key-value store for tests and single-process pipelines.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use itertools::Itertools;

use super::KeyValueStore;
use crate::{Error, Result};

/// Key-value store backed by a `HashMap`.
///
/// Writes can be switched to fail, to exercise the fatal persistence path.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: tokio::sync::RwLock<HashMap<(String, String), Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `put` and `delete` fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All entries of one namespace, sorted by key.
    pub async fn snapshot(&self, namespace: &str) -> BTreeMap<String, Vec<u8>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Sorted keys of one namespace.
    pub async fn keys(&self, namespace: &str) -> Vec<String> {
        self.snapshot(namespace).await.into_keys().collect_vec()
    }

    fn check_writable(&self, operation: &'static str, namespace: &str, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage_failed(
                operation,
                namespace,
                key,
                "storage unavailable",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable("put", namespace, key)?;
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.check_writable("delete", namespace, key)?;
        self.entries
            .write()
            .await
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}
