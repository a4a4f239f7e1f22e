//! Client for the replicated storage service's HTTP interface.
//!
//! Keys are flattened to a single path segment `namespace-key`:
//! `POST` stores the request body, `GET` reads it (404 when absent),
//! `DELETE` removes it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

use super::KeyValueStore;
use crate::{Error, Result};

/// Key-value store talking to the storage service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpKvStore {
    client: Client,
    base: Url,
}

impl HttpKvStore {
    /// Create a client for the service at `base` (e.g. `http://storage:9999`).
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `base` is not an absolute http(s) URL.
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| Error::invalid_config(format!("storage address '{base}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::invalid_config(format!(
                "storage address '{base}' cannot carry a path"
            )));
        }
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    fn url_for(&self, namespace: &str, key: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::invalid_config(format!("storage address '{}'", self.base)))?
            .pop_if_empty()
            .push(&format!("{namespace}-{key}"));
        Ok(url)
    }
}

#[async_trait]
impl KeyValueStore for HttpKvStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let fail = |reason: String| Error::storage_failed("put", namespace, key, reason);
        let response = self
            .client
            .post(self.url_for(namespace, key)?)
            .body(value)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(fail(format!("storage service answered {}", response.status())))
        }
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let fail = |reason: String| Error::storage_failed("get", namespace, key, reason);
        let response = self
            .client
            .get(self.url_for(namespace, key)?)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.bytes().await.map_err(|e| fail(e.to_string()))?;
                Ok(Some(body.to_vec()))
            }
            status => Err(fail(format!("storage service answered {status}"))),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let fail = |reason: String| Error::storage_failed("delete", namespace, key, reason);
        let response = self
            .client
            .delete(self.url_for(namespace, key)?)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(fail(format!("storage service answered {status}")))
        }
    }
}
