use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::{Duration, sleep};
use tracing::warn;

use crate::EnsembleError;
use crate::kvs::DynKvStore;
use crate::metrics;

const BACKOFF_MIN_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 2_000;

/// FIFO queue whose entire contents live under a single KVS key.
///
/// Every mutation is a read–modify–CAS cycle: losing the race costs a
/// randomized 1–2 s backoff and a retry, while transport and decode errors
/// surface immediately. Throughput is human-scale by design; total ordering
/// is what matters here.
pub struct CasQueue<T> {
    kvs: DynKvStore,
    key: String,
    _items: PhantomData<fn() -> T>,
}

impl<T> CasQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(kvs: DynKvStore, key: impl Into<String>) -> Self {
        Self {
            kvs,
            key: key.into(),
            _items: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append `item` to the tail, retrying until the CAS write lands.
    pub async fn enqueue(&self, item: &T) -> Result<(), EnsembleError> {
        let encoded = serde_json::to_value(item)?;
        loop {
            let (mut items, version) = self.read_raw().await?;
            items.push(encoded.clone());
            let payload = serde_json::to_vec(&items)?;
            if self.kvs.cas_put(&self.key, payload, version).await? {
                return Ok(());
            }
            self.backoff().await;
        }
    }

    /// Pop the head, or `None` when the queue is absent or empty.
    pub async fn dequeue(&self) -> Result<Option<T>, EnsembleError> {
        loop {
            let (mut items, version) = self.read_raw().await?;
            if items.is_empty() {
                return Ok(None);
            }
            let head = items.remove(0);
            let payload = serde_json::to_vec(&items)?;
            if self.kvs.cas_put(&self.key, payload, version).await? {
                return Ok(Some(serde_json::from_value(head)?));
            }
            self.backoff().await;
        }
    }

    /// Non-mutating snapshot of the whole queue.
    pub async fn items(&self) -> Result<Vec<T>, EnsembleError> {
        match self.kvs.get(&self.key).await? {
            Some(entry) if !entry.value.is_empty() => Ok(serde_json::from_slice(&entry.value)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Drop the queue key entirely.
    pub async fn clear(&self) -> Result<(), EnsembleError> {
        self.kvs.delete(&self.key).await
    }

    async fn read_raw(&self) -> Result<(Vec<serde_json::Value>, u64), EnsembleError> {
        match self.kvs.get(&self.key).await? {
            Some(entry) if !entry.value.is_empty() => {
                let items = serde_json::from_slice(&entry.value)?;
                Ok((items, entry.version))
            }
            Some(entry) => Ok((Vec::new(), entry.version)),
            None => Ok((Vec::new(), 0)),
        }
    }

    async fn backoff(&self) {
        metrics::record_cas_retry(&self.key);
        let wait = Duration::from_millis(fastrand::u64(BACKOFF_MIN_MS..BACKOFF_MAX_MS));
        warn!(
            key = %self.key,
            wait_ms = wait.as_millis() as u64,
            "queue write lost compare-and-swap race, backing off"
        );
        sleep(wait).await;
    }
}
