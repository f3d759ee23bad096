//! Bucket listing and the checkpoint-aware scanner built on top of it.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::{
    error::{Result, SluiceError},
    types::{DiscoveredObject, ObjectEntry},
};

pub mod memory;
pub mod store;

pub use memory::InMemoryObjectLister;
pub use store::ObjectStoreLister;

/// Storage collaborator: a flat listing of every object whose key starts
/// with `prefix`. No change feed is assumed.
#[async_trait]
pub trait ObjectLister: Send + Sync {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>>;
}

/// Result of one scan. A failed listing yields no objects and carries the
/// error back for the caller to log.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub objects: Vec<DiscoveredObject>,
    pub error: Option<SluiceError>,
}

#[derive(Clone)]
pub struct Scanner {
    lister: Arc<dyn ObjectLister>,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner").finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(lister: Arc<dyn ObjectLister>) -> Self {
        Self { lister }
    }

    /// List `bucket/prefix` and keep objects modified strictly after
    /// `since`, oldest first. Never fails; listing errors come back inside
    /// the outcome.
    pub async fn scan(
        &self,
        bucket: &str,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> ScanOutcome {
        let entries = match self.lister.list_objects(bucket, prefix).await {
            Ok(entries) => entries,
            Err(error) => {
                debug!(
                    target: "sluice::scanner",
                    bucket,
                    prefix,
                    error = %error,
                    "listing failed"
                );
                return ScanOutcome {
                    objects: Vec::new(),
                    error: Some(error),
                };
            }
        };

        let listed = entries.len();
        let mut objects: Vec<DiscoveredObject> = entries
            .into_iter()
            .filter(|entry| entry.modified > since)
            .map(|entry| DiscoveredObject {
                bucket: bucket.to_string(),
                key: entry.key,
                modified: entry.modified,
            })
            .collect();
        objects.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));

        trace!(
            target: "sluice::scanner",
            bucket,
            prefix,
            listed,
            discovered = objects.len(),
            "scan complete"
        );

        ScanOutcome {
            objects,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn boundary_object_is_excluded() {
        let lister = Arc::new(InMemoryObjectLister::new());
        lister.put_object("uploads", "at-boundary.jpg", t0(), 10).await;
        lister
            .put_object("uploads", "just-after.jpg", t0() + Duration::milliseconds(1), 10)
            .await;
        lister
            .put_object("uploads", "before.jpg", t0() - Duration::seconds(1), 10)
            .await;

        let scanner = Scanner::new(lister);
        let outcome = scanner.scan("uploads", "", t0()).await;

        assert!(outcome.error.is_none());
        let keys: Vec<_> = outcome.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["just-after.jpg"]);
        assert_eq!(outcome.objects[0].bucket, "uploads");
    }

    #[tokio::test]
    async fn results_are_ordered_and_prefix_scoped() {
        let lister = Arc::new(InMemoryObjectLister::new());
        lister
            .put_object("uploads", "photos/b.jpg", t0() + Duration::seconds(2), 1)
            .await;
        lister
            .put_object("uploads", "photos/a.jpg", t0() + Duration::seconds(2), 1)
            .await;
        lister
            .put_object("uploads", "photos/z.jpg", t0() + Duration::seconds(1), 1)
            .await;
        lister
            .put_object("uploads", "videos/a.mp4", t0() + Duration::seconds(1), 1)
            .await;

        let outcome = Scanner::new(lister).scan("uploads", "photos/", t0()).await;
        let keys: Vec<_> = outcome.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/z.jpg", "photos/a.jpg", "photos/b.jpg"]);
    }

    #[tokio::test]
    async fn listing_failure_returns_empty_outcome() {
        let lister = Arc::new(InMemoryObjectLister::new());
        lister
            .put_object("uploads", "photo.jpg", t0() + Duration::seconds(1), 1)
            .await;
        lister.fail_with("connection reset").await;

        let scanner = Scanner::new(lister.clone());
        let outcome = scanner.scan("uploads", "", t0()).await;
        assert!(outcome.objects.is_empty());
        assert!(matches!(outcome.error, Some(SluiceError::Storage(_))));

        lister.recover().await;
        let outcome = scanner.scan("uploads", "", t0()).await;
        assert_eq!(outcome.objects.len(), 1);
    }
}
