//! SurrealDB-backed key-value store.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tracing::info;

use super::KeyValueStore;
use crate::{Error, Result};

const TABLE: &str = "kv";

/// Connection settings for [`SurrealKvStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection URL (e.g., "mem://", "ws://localhost:8000")
    pub url: String,
    /// Namespace to use
    pub namespace: String,
    /// Database to use
    pub database: String,
    /// Optional root credentials
    pub credentials: Option<Credentials>,
}

/// Root credentials for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl StoreConfig {
    /// In-memory database, lost when the process exits.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "stagewise".to_string(),
            database: "test".to_string(),
            credentials: None,
        }
    }

    /// Remote database over WebSocket.
    #[must_use]
    pub fn websocket(host: &str, port: u16) -> Self {
        Self::remote(format!("ws://{host}:{port}"))
    }

    /// Remote database at a full URL.
    #[must_use]
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: "stagewise".to_string(),
            database: "pipeline".to_string(),
            credentials: None,
        }
    }

    /// Set credentials for authentication.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KvRecord {
    namespace: String,
    key: String,
    value: Vec<u8>,
}

fn record_id(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

/// Key-value store persisting to a SurrealDB table.
#[derive(Debug, Clone)]
pub struct SurrealKvStore {
    db: Arc<Surreal<Any>>,
}

impl SurrealKvStore {
    /// Connect and select the configured namespace and database.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if connecting, signing in, or selecting the
    /// database fails.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let connect_error =
            |e: surrealdb::Error| Error::storage_failed("connect", &config.namespace, &config.url, e.to_string());

        let db = Surreal::<Any>::init();
        db.connect(&config.url).await.map_err(connect_error)?;

        if let Some(creds) = &config.credentials {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(connect_error)?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(connect_error)?;

        info!(url = %config.url, database = %config.database, "Connected to SurrealDB store");
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl KeyValueStore for SurrealKvStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let record = KvRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
        };
        let _: Option<KvRecord> = self
            .db
            .upsert((TABLE, record_id(namespace, key)))
            .content(record)
            .await
            .map_err(|e| Error::storage_failed("put", namespace, key, e.to_string()))?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let record: Option<KvRecord> = self
            .db
            .select((TABLE, record_id(namespace, key)))
            .await
            .map_err(|e| Error::storage_failed("get", namespace, key, e.to_string()))?;
        Ok(record.map(|r| r.value))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let _: Option<KvRecord> = self
            .db
            .delete((TABLE, record_id(namespace, key)))
            .await
            .map_err(|e| Error::storage_failed("delete", namespace, key, e.to_string()))?;
        Ok(())
    }
}
