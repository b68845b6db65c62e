use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CatalogNode, HeldLock, KvEntry, KvStore};
use crate::EnsembleError;

const ACQUIRE_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ConsulKvsConfig {
    /// Agent base URL, e.g. `http://127.0.0.1:8500`.
    pub url: String,
    /// Session TTL; a dead lock holder is released after at most this long.
    pub lock_ttl: Duration,
}

impl ConsulKvsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            lock_ttl: Duration::from_secs(15),
        }
    }
}

/// Consul-backed implementation of [`KvStore`].
///
/// Values travel base64-encoded in the KV listing API; version tokens map to
/// Consul's `ModifyIndex`, and locks are session-backed `?acquire` puts.
pub struct ConsulKvs {
    client: reqwest::Client,
    config: ConsulKvsConfig,
}

#[derive(Debug, Deserialize)]
struct RawKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawCatalogNode {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address")]
    address: String,
}

impl ConsulKvs {
    pub fn new(config: ConsulKvsConfig) -> Result<Self, EnsembleError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| EnsembleError::kvs(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.config.url, key)
    }

    fn decode_entry(&self, raw: RawKvEntry) -> Result<KvEntry, EnsembleError> {
        let value = match raw.value {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|err| EnsembleError::kvs(format!("undecodable value at {}: {err}", raw.key)))?,
            None => Vec::new(),
        };
        Ok(KvEntry {
            key: raw.key,
            value,
            version: raw.modify_index,
        })
    }

    async fn put_with_query(
        &self,
        key: &str,
        value: Vec<u8>,
        query: &[(&str, String)],
    ) -> Result<bool, EnsembleError> {
        let response = self
            .client
            .put(self.kv_url(key))
            .query(query)
            .body(value)
            .send()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .error_for_status()
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;
        Ok(body.trim() == "true")
    }

    async fn create_session(&self) -> Result<String, EnsembleError> {
        let body = json!({
            "TTL": format!("{}s", self.config.lock_ttl.as_secs()),
            "Behavior": "release",
            "LockDelay": "1s",
        });
        let session: RawSession = self
            .client
            .put(format!("{}/v1/session/create", self.config.url))
            .json(&body)
            .send()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .error_for_status()
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .json()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;
        Ok(session.id)
    }
}

#[async_trait]
impl KvStore for ConsulKvs {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, EnsembleError> {
        let response = self
            .client
            .get(self.kv_url(key))
            .send()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: Vec<RawKvEntry> = response
            .error_for_status()
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .json()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;

        raw.into_iter()
            .next()
            .map(|entry| self.decode_entry(entry))
            .transpose()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EnsembleError> {
        self.put_with_query(key, value, &[]).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), EnsembleError> {
        self.client
            .delete(self.kv_url(key))
            .send()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .error_for_status()
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, EnsembleError> {
        let response = self
            .client
            .get(self.kv_url(prefix))
            .query(&[("recurse", "true")])
            .send()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let raw: Vec<RawKvEntry> = response
            .error_for_status()
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .json()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;

        let mut entries = raw
            .into_iter()
            .map(|entry| self.decode_entry(entry))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn cas_put(
        &self,
        key: &str,
        value: Vec<u8>,
        version: u64,
    ) -> Result<bool, EnsembleError> {
        self.put_with_query(key, value, &[("cas", version.to_string())])
            .await
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn HeldLock>, EnsembleError> {
        let session = self.create_session().await?;

        loop {
            let acquired = self
                .put_with_query(key, Vec::new(), &[("acquire", session.clone())])
                .await?;
            if acquired {
                debug!(key = %key, session = %session, "acquired distributed lock");
                return Ok(Box::new(ConsulLock {
                    client: self.client.clone(),
                    base_url: self.config.url.clone(),
                    key: key.to_string(),
                    session,
                }));
            }
            tokio::time::sleep(ACQUIRE_RETRY).await;
        }
    }

    async fn catalog_nodes(&self) -> Result<Vec<CatalogNode>, EnsembleError> {
        let raw: Vec<RawCatalogNode> = self
            .client
            .get(format!("{}/v1/catalog/nodes", self.config.url))
            .send()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .error_for_status()
            .map_err(|err| EnsembleError::kvs(err.to_string()))?
            .json()
            .await
            .map_err(|err| EnsembleError::kvs(err.to_string()))?;

        Ok(raw
            .into_iter()
            .map(|node| CatalogNode {
                name: node.node,
                address: node.address,
            })
            .collect())
    }
}

struct ConsulLock {
    client: reqwest::Client,
    base_url: String,
    key: String,
    session: String,
}

impl HeldLock for ConsulLock {
    fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ConsulLock {
    fn drop(&mut self) {
        let client = self.client.clone();
        let release_url = format!("{}/v1/kv/{}", self.base_url, self.key);
        let destroy_url = format!("{}/v1/session/destroy/{}", self.base_url, self.session);
        let session = self.session.clone();
        let key = self.key.clone();

        // Best effort: if the release never lands, the session TTL frees
        // the lock on the server side.
        tokio::spawn(async move {
            let released = client
                .put(release_url)
                .query(&[("release", session.as_str())])
                .send()
                .await;
            if let Err(err) = released {
                warn!(key = %key, error = %err, "failed to release distributed lock");
            }
            if let Err(err) = client.put(destroy_url).send().await {
                warn!(key = %key, error = %err, "failed to destroy lock session");
            }
        });
    }
}
