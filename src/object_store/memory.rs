//! In-memory object store for tests and standalone runs.
//!
//! Last-modified timestamps come from a clock that advances by one
//! millisecond per write, so "latest" is always the most recent write even
//! when writes land within the same wall-clock tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{validate_key, ObjectMeta, ObjectStore, ObjectStoreError, Result};

struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    clock: Option<DateTime<Utc>>,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if last >= now => last + Duration::milliseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }
}

/// In-memory object store.
pub struct MemoryObjectStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Override an object's last-modified time (for age-based tests).
    pub async fn set_last_modified(&self, bucket: &str, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let object = state
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.get_mut(key))
            .ok_or_else(|| not_found(bucket, key))?;
        object.last_modified = at;
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(bucket: &str, key: &str) -> ObjectStoreError {
    ObjectStoreError::NotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.read().await.buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.check_available()?;
        validate_key(bucket)?;
        self.state
            .write()
            .await
            .buckets
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.check_available()?;
        let state = self.state.read().await;
        let Some(objects) = state.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                last_modified: object.last_modified,
                size: object.body.len() as u64,
            })
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.check_available()?;
        let state = self.state.read().await;
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.body.clone())
            .ok_or_else(|| not_found(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.check_available()?;
        validate_key(key)?;
        let mut state = self.state.write().await;
        let last_modified = state.tick();
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| ObjectStoreError::BucketNotFound(bucket.to_string()))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                last_modified,
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.remove(key))
            .map(|_| ())
            .ok_or_else(|| not_found(bucket, key))
    }
}
