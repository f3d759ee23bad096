use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::ObjectLister;
use crate::{
    error::{Result, SluiceError},
    types::ObjectEntry,
};

/// Bucket contents held in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryObjectLister {
    buckets: RwLock<HashMap<String, BTreeMap<String, ObjectEntry>>>,
    failure: RwLock<Option<String>>,
    list_calls: AtomicUsize,
}

impl InMemoryObjectLister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an object.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        modified: DateTime<Utc>,
        size: u64,
    ) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), ObjectEntry::new(key, modified, size));
    }

    pub async fn remove_object(&self, bucket: &str, key: &str) -> bool {
        let mut buckets = self.buckets.write().await;
        buckets
            .get_mut(bucket)
            .is_some_and(|objects| objects.remove(key).is_some())
    }

    /// Every listing fails with `message` until [`recover`](Self::recover).
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }

    pub async fn recover(&self) {
        *self.failure.write().await = None;
    }

    /// Number of `list_objects` calls served so far, failed ones included.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectLister for InMemoryObjectLister {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.failure.read().await.as_ref() {
            return Err(SluiceError::Storage(format!(
                "listing {bucket}/{prefix} failed: {message}"
            )));
        }

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Err(SluiceError::NotFound(format!("bucket {bucket}")));
        };

        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}
