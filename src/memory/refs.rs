//! Reference store
//!
//! Time-expiring key → value cache that lets tools hand bulky artifacts
//! (document text, parsed statements, transaction lists) to each other while
//! only an opaque key crosses into the model-visible transcript.
//!
//! Entries expire after a fixed TTL measured from creation; reads never
//! refresh it. At capacity the oldest-created entry is evicted. Keys may be
//! read any number of times until they expire.

use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque handle to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefKey(String);

impl RefKey {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RefKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RefKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    created_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RefKey, Entry>,
    /// Keys in creation order
    order: VecDeque<RefKey>,
}

impl Inner {
    fn purge_expired(&mut self, ttl: Duration, now: Instant) {
        while let Some(front) = self.order.front() {
            match self.entries.get(front) {
                Some(entry) if now.duration_since(entry.created_at) < ttl => break,
                Some(_) => {
                    if let Some(key) = self.order.pop_front() {
                        self.entries.remove(&key);
                        debug!(ref_key = %key, "reference expired");
                    }
                }
                None => {
                    self.order.pop_front();
                }
            }
        }
    }

    fn evict_oldest(&mut self) {
        while let Some(key) = self.order.pop_front() {
            if self.entries.remove(&key).is_some() {
                warn!(ref_key = %key, "reference store at capacity, evicted oldest entry");
                return;
            }
        }
    }
}

pub struct ReferenceStore {
    inner: RwLock<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl ReferenceStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Store `value` under a fresh key and start its TTL clock.
    pub async fn put<T>(&self, value: T) -> RefKey
    where
        T: Any + Send + Sync,
    {
        let key = RefKey::generate();
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        inner.purge_expired(self.ttl, now);
        while inner.entries.len() >= self.capacity {
            inner.evict_oldest();
        }
        inner.entries.insert(
            key.clone(),
            Entry {
                value: Arc::new(value),
                created_at: now,
            },
        );
        inner.order.push_back(key.clone());

        info!(ref_key = %key, "stored value in reference store");
        key
    }

    /// Resolve `key` to its value.
    ///
    /// Fails with `ReferenceNotFound` for unissued, expired or evicted keys and
    /// with `ReferenceTypeMismatch` when the entry holds another type.
    pub async fn get<T>(&self, key: &RefKey) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let inner = self.inner.read().await;
        let entry = inner.entries.get(key).filter(|e| {
            Instant::now().duration_since(e.created_at) < self.ttl
        });

        let Some(entry) = entry else {
            warn!(ref_key = %key, "reference not found or expired");
            return Err(OrchestrationError::ReferenceNotFound(key.to_string()));
        };

        Arc::clone(&entry.value)
            .downcast::<T>()
            .map_err(|_| OrchestrationError::ReferenceTypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Remove `key` if present.
    pub async fn delete(&self, key: &RefKey) {
        let mut inner = self.inner.write().await;
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
            info!(ref_key = %key, "deleted reference");
        }
    }

    /// Most entries held at once; a `put` beyond this evicts the oldest.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live (unexpired) entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|e| now.duration_since(e.created_at) < self.ttl)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry (process teardown).
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn store() -> ReferenceStore {
        ReferenceStore::new(Duration::from_secs(600), 100)
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let refs = store();
        let key = refs.put(String::from("bank statement text")).await;
        let value = refs.get::<String>(&key).await.unwrap();
        assert_eq!(value.as_str(), "bank statement text");

        // multi-read until TTL
        assert!(refs.get::<String>(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_unissued_key_is_not_found() {
        let refs = store();
        let err = refs.get::<String>(&RefKey::from("nope")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ReferenceNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl_without_refresh() {
        let refs = ReferenceStore::new(Duration::from_secs(10), 10);
        let key = refs.put(vec![1u8, 2, 3]).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(refs.get::<Vec<u8>>(&key).await.is_ok());

        // the read above must not have extended the TTL
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_err!(refs.get::<Vec<u8>>(&key).await);
        assert!(refs.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_created() {
        let refs = ReferenceStore::new(Duration::from_secs(600), 2);
        let first = refs.put(1u32).await;
        let second = refs.put(2u32).await;
        let third = refs.put(3u32).await;

        assert!(refs.get::<u32>(&first).await.is_err());
        assert_eq!(*refs.get::<u32>(&second).await.unwrap(), 2);
        assert_eq!(*refs.get::<u32>(&third).await.unwrap(), 3);
        assert_eq!(refs.len().await, 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let refs = store();
        let key = refs.put(42i64).await;
        let kept = refs.put(7i64).await;
        refs.delete(&key).await;
        refs.delete(&key).await;
        assert!(refs.get::<i64>(&key).await.is_err());

        let inner = refs.inner.read().await;
        assert_eq!(inner.order.len(), 1);
        assert_eq!(inner.order.front(), Some(&kept));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_reported() {
        let refs = store();
        let key = refs.put(String::from("text")).await;
        let err = refs.get::<u64>(&key).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ReferenceTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_puts_and_gets() {
        let refs = Arc::new(store());
        let mut handles = Vec::new();
        for i in 0..32u64 {
            let refs = Arc::clone(&refs);
            handles.push(tokio::spawn(async move {
                let key = refs.put(i).await;
                let got = refs.get::<u64>(&key).await.unwrap();
                assert_eq!(*got, i);
                refs.delete(&key).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(refs.is_empty().await);
    }
}
