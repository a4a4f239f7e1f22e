//! Durable per-stream recovery state of one worker.
//!
//! Layout inside the worker's namespace:
//!
//! | key              | value                                   |
//! |------------------|-----------------------------------------|
//! | `done_count`     | JSON map: stream → sorted sender ids    |
//! | `done_sent`      | JSON array of streams already forwarded |
//! | `active_streams` | JSON array of streams with a message log |
//! | `log/{cid}/{n}`  | raw body of the n-th accepted message   |
//!
//! Logs are gapless from 0, so readers stop at the first absent key.
//!
//! `done_sent` is a tombstone: discarding a stream never removes it, so a
//! done-marker redelivered after termination is still recognized.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::persistence::KeyValueStore;
use crate::{CorrelationId, Error, Result, WorkerId};

const DONE_COUNT_KEY: &str = "done_count";
const DONE_SENT_KEY: &str = "done_sent";
const ACTIVE_STREAMS_KEY: &str = "active_streams";

fn log_key(correlation_id: &CorrelationId, seq: u64) -> String {
    format!("log/{correlation_id}/{seq}")
}

/// In-memory mirror of a worker's durable stream state, written through on
/// every change.
pub struct StreamStateStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    done_count: BTreeMap<CorrelationId, BTreeSet<String>>,
    done_sent: BTreeSet<CorrelationId>,
    active: BTreeSet<CorrelationId>,
}

impl std::fmt::Debug for StreamStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStateStore")
            .field("namespace", &self.namespace)
            .field("done_count", &self.done_count)
            .field("done_sent", &self.done_sent)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl StreamStateStore {
    /// Load the state of `worker` from `store`.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if a read fails, or `Serialization` if a stored
    /// document is corrupt.
    pub async fn load(store: Arc<dyn KeyValueStore>, worker: &WorkerId) -> Result<Self> {
        let namespace = worker.namespace();
        let done_count = read_json(store.as_ref(), &namespace, DONE_COUNT_KEY).await?;
        let done_sent = read_json(store.as_ref(), &namespace, DONE_SENT_KEY).await?;
        let active = read_json(store.as_ref(), &namespace, ACTIVE_STREAMS_KEY).await?;

        Ok(Self {
            store,
            namespace,
            done_count,
            done_sent,
            active,
        })
    }

    /// Storage namespace of the owning worker.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Senders whose done-marker was recorded for `correlation_id`.
    #[must_use]
    pub fn done_senders(&self, correlation_id: &CorrelationId) -> Option<&BTreeSet<String>> {
        self.done_count.get(correlation_id)
    }

    /// Number of distinct senders recorded for `correlation_id`.
    #[must_use]
    pub fn done_received(&self, correlation_id: &CorrelationId) -> usize {
        self.done_count.get(correlation_id).map_or(0, BTreeSet::len)
    }

    /// Streams with at least one recorded done-marker.
    pub fn tracked_streams(&self) -> impl Iterator<Item = &CorrelationId> {
        self.done_count.keys()
    }

    /// Whether done-markers were already forwarded for `correlation_id`.
    #[must_use]
    pub fn is_done_sent(&self, correlation_id: &CorrelationId) -> bool {
        self.done_sent.contains(correlation_id)
    }

    /// Streams forwarded but not yet fully discarded.
    pub fn undiscarded_streams(&self) -> impl Iterator<Item = &CorrelationId> {
        self.done_sent
            .iter()
            .filter(|cid| self.active.contains(*cid) || self.done_count.contains_key(*cid))
    }

    /// Whether `correlation_id` has a persisted message log.
    #[must_use]
    pub fn is_active(&self, correlation_id: &CorrelationId) -> bool {
        self.active.contains(correlation_id)
    }

    /// Streams with a persisted message log.
    pub fn active_streams(&self) -> impl Iterator<Item = &CorrelationId> {
        self.active.iter()
    }

    /// Record a done-marker sender and persist the updated counts.
    ///
    /// Returns `false` without writing if the sender was already recorded.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the write fails.
    pub async fn record_done(&mut self, correlation_id: &CorrelationId, sender: &str) -> Result<bool> {
        let inserted = self
            .done_count
            .entry(correlation_id.clone())
            .or_default()
            .insert(sender.to_string());
        if inserted {
            self.write_json(DONE_COUNT_KEY, &self.done_count).await?;
        }
        Ok(inserted)
    }

    /// Persist that done-markers for `correlation_id` were forwarded.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the write fails.
    pub async fn mark_done_sent(&mut self, correlation_id: &CorrelationId) -> Result<()> {
        if self.done_sent.insert(correlation_id.clone()) {
            self.write_json(DONE_SENT_KEY, &self.done_sent).await?;
        }
        Ok(())
    }

    /// Persist that `correlation_id` has a message log.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the write fails.
    pub async fn mark_active(&mut self, correlation_id: &CorrelationId) -> Result<()> {
        if self.active.insert(correlation_id.clone()) {
            self.write_json(ACTIVE_STREAMS_KEY, &self.active).await?;
        }
        Ok(())
    }

    /// Persist the `seq`-th accepted body of a stream.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the write fails.
    pub async fn append_log(&self, correlation_id: &CorrelationId, seq: u64, body: Vec<u8>) -> Result<()> {
        self.store
            .put(&self.namespace, &log_key(correlation_id, seq), body)
            .await
    }

    /// Read a stream's message log in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if a read fails.
    pub async fn read_log(&self, correlation_id: &CorrelationId) -> Result<Vec<Vec<u8>>> {
        let mut entries = Vec::new();
        let mut seq: u64 = 0;
        while let Some(body) = self
            .store
            .get(&self.namespace, &log_key(correlation_id, seq))
            .await?
        {
            entries.push(body);
            seq = seq.saturating_add(1);
        }
        Ok(entries)
    }

    /// Drop the log, activity and fan-in state of a stream.
    ///
    /// Log entries go first, highest sequence number down, so an interrupted
    /// discard leaves a readable prefix. The `done_sent` tombstone stays.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if any write fails.
    pub async fn discard(&mut self, correlation_id: &CorrelationId) -> Result<()> {
        let log_len = self.read_log(correlation_id).await?.len();
        for seq in (0..log_len).rev() {
            let seq = u64::try_from(seq).map_err(|e| Error::serialization(e.to_string()))?;
            self.store
                .delete(&self.namespace, &log_key(correlation_id, seq))
                .await?;
        }

        if self.active.remove(correlation_id) {
            self.write_json(ACTIVE_STREAMS_KEY, &self.active).await?;
        }
        if self.done_count.remove(correlation_id).is_some() {
            self.write_json(DONE_COUNT_KEY, &self.done_count).await?;
        }

        debug!(namespace = %self.namespace, correlation_id = %correlation_id, log_len, "Discarded stream state");
        Ok(())
    }

    async fn write_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::serialization(e.to_string()))?;
        self.store.put(&self.namespace, key, bytes).await
    }
}

async fn read_json<T: DeserializeOwned + Default>(
    store: &dyn KeyValueStore,
    namespace: &str,
    key: &str,
) -> Result<T> {
    match store.get(namespace, key).await? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            Error::serialization(format!("corrupt '{namespace}/{key}': {e}"))
        }),
        None => Ok(T::default()),
    }
}
