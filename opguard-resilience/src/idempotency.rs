//! Idempotency keys and result caching.
//!
//! A retried operation may carry an idempotency key. When a result is already
//! recorded under that key it is returned without invoking the operation
//! again. Results are stored as JSON so any serializable value can be cached.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors raised by idempotency stores
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),
}

/// A cached operation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Backing storage for idempotency records
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Insert or replace the record for `record.key`
    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError>;

    /// Returns whether a record was removed
    async fn remove(&self, key: &str) -> Result<bool, IdempotencyError>;
}

/// Process-local store. Records live until cleared.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, IdempotencyError> {
        Ok(self.records.remove(key).is_some())
    }
}

/// Computes keys and mediates access to an [`IdempotencyStore`].
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryIdempotencyStore::new()))
    }

    /// Deterministic key for an operation invocation: the hex SHA-256 of the
    /// length-prefixed fields, so moving characters between fields always
    /// yields a different key.
    pub fn compute_key(operation_name: &str, tenant_id: &str, correlation_id: &str) -> String {
        let mut hasher = Sha256::new();
        for field in [operation_name, tenant_id, correlation_id] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Look up a record. Store failures are logged and reported as a miss.
    pub async fn check(&self, key: &str) -> Option<IdempotencyRecord> {
        match self.store.get(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(idempotency_key = key, error = %e, "Idempotency lookup failed");
                None
            }
        }
    }

    /// Look up a record and decode its result as `T`. A record that does not
    /// decode is treated as a miss.
    pub async fn check_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let record = self.check(key).await?;
        match serde_json::from_value(record.result) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    idempotency_key = key,
                    error = %e,
                    "Cached idempotency result has an unexpected shape, ignoring"
                );
                None
            }
        }
    }

    /// Store `result` under `key`, replacing any previous record.
    pub async fn record<T: Serialize + ?Sized>(
        &self,
        key: &str,
        result: &T,
        metadata: Map<String, Value>,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        let record = IdempotencyRecord {
            key: key.to_string(),
            result: serde_json::to_value(result)?,
            metadata,
            recorded_at: Utc::now(),
        };
        self.store.put(record.clone()).await?;
        debug!(idempotency_key = key, "Recorded idempotent result");
        Ok(record)
    }

    /// Remove the record for `key`. Returns whether one existed.
    pub async fn clear(&self, key: &str) -> bool {
        match self.store.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(idempotency_key = key, error = %e, "Failed to clear idempotency record");
                false
            }
        }
    }
}

impl std::fmt::Debug for IdempotencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyManager").finish_non_exhaustive()
    }
}
