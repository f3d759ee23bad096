use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, path::Path,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ObjectLister;
use crate::{
    config::{StorageBackend, StorageConfig},
    error::{Result, SluiceError},
    types::ObjectEntry,
};

/// [`ObjectLister`] backed by the `object_store` crate. One client is built
/// lazily per bucket and reused across polls.
pub struct ObjectStoreLister {
    config: StorageConfig,
    clients: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl fmt::Debug for ObjectStoreLister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreLister")
            .field("backend", &self.config.backend)
            .field("endpoint", &self.config.endpoint)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreLister {
    /// Fails when the local backend has no usable root directory.
    pub fn new(config: StorageConfig) -> Result<Self> {
        if config.backend == StorageBackend::Local {
            let root = local_root(&config)?;
            if !root.is_dir() {
                return Err(SluiceError::Storage(format!(
                    "local storage root {} is not a directory",
                    root.display()
                )));
            }
        }

        info!(
            target: "sluice::scanner",
            backend = ?config.backend,
            endpoint = config.endpoint.as_deref().unwrap_or("default"),
            "object store lister ready"
        );

        Ok(Self {
            config,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch at most one listing page from `bucket` to prove the backend is
    /// reachable and the bucket exists.
    pub async fn probe(&self, bucket: &str) -> Result<()> {
        let client = self.client(bucket).await?;
        let first = client.list(None).try_next().await?;
        debug!(
            target: "sluice::scanner",
            bucket,
            empty = first.is_none(),
            "bucket reachable"
        );
        Ok(())
    }

    async fn client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(bucket) {
            return Ok(Arc::clone(existing));
        }

        let client = self.build_client(bucket)?;
        debug!(target: "sluice::scanner", bucket, "created object store client");
        clients.insert(bucket.to_string(), Arc::clone(&client));
        Ok(client)
    }

    fn build_client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        match self.config.backend {
            StorageBackend::S3 => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_allow_http(self.config.allow_http);
                if let Some(region) = &self.config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &self.config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                Ok(Arc::new(builder.build()?))
            }
            StorageBackend::Local => {
                let root = local_root(&self.config)?.join(bucket);
                if !root.is_dir() {
                    return Err(SluiceError::NotFound(format!(
                        "bucket directory {} does not exist",
                        root.display()
                    )));
                }
                Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?))
            }
        }
    }
}

fn local_root(config: &StorageConfig) -> Result<PathBuf> {
    config.local_root.clone().ok_or_else(|| {
        SluiceError::Storage("local storage backend requires local_root".to_string())
    })
}

/// Directory part of a raw key prefix. `object_store` lists by path segment,
/// so the listing starts at the last `/` and the remainder is matched as a
/// plain string prefix.
fn list_root(prefix: &str) -> Option<Path> {
    prefix
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
        .map(Path::from)
}

#[async_trait]
impl ObjectLister for ObjectStoreLister {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>> {
        let client = self.client(bucket).await?;
        let root = list_root(prefix);

        let mut stream = client.list(root.as_ref());
        let mut entries = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            let key = meta.location.as_ref();
            if !key.starts_with(prefix) {
                continue;
            }
            entries.push(ObjectEntry::new(key, meta.last_modified, meta.size as u64));
        }
        Ok(entries)
    }
}
