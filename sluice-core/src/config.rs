use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Per-consumer tuning for dispatch fan-out and checkpoint plumbing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Worker tasks invoking functions for a single consumer.
    pub dispatch_workers: usize,
    /// Objects queued per consumer before the poller waits for workers.
    pub dispatch_queue_capacity: usize,
    /// Checkpoint advances buffered between pollers and the status writer.
    pub checkpoint_channel_capacity: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            dispatch_workers: 4,
            dispatch_queue_capacity: 256,
            checkpoint_channel_capacity: 1024,
        }
    }
}

/// How function endpoints are addressed and called.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub scheme: String,
    /// Suffix appended to `<function>.<namespace>` when building endpoints.
    pub cluster_domain: String,
    /// Port used when a function does not declare one.
    pub default_port: u16,
    pub request_timeout_ms: u64,
    /// Value of the `event-namespace` header on every invocation.
    pub event_namespace: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            cluster_domain: "svc.cluster.local".to_string(),
            default_port: 8080,
            request_timeout_ms: 30_000,
            event_namespace: "s3triggers.sluice.dev".to_string(),
        }
    }
}

impl InvokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    S3,
    /// Buckets are directories under `local_root`.
    Local,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Falls back to `AWS_DEFAULT_REGION`/`AWS_REGION` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom S3 endpoint (MinIO, Ceph, LocalStack).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub allow_http: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding `<namespace>/{triggers,functions}` manifests.
    pub root: PathBuf,
    /// How often the directory is re-read for external edits.
    pub refresh_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("registry"),
            refresh_interval_ms: 2_000,
        }
    }
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Full list-and-diff cadence; also restarts consumers that died.
    pub resync_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: 5 * 60 * 1_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let consumer: ConsumerSettings =
            serde_json::from_str(r#"{"dispatch_workers": 2}"#).unwrap();
        assert_eq!(consumer.dispatch_workers, 2);
        assert_eq!(consumer.dispatch_queue_capacity, 256);

        let storage: StorageConfig =
            serde_json::from_str(r#"{"backend": "local", "local_root": "/data"}"#)
                .unwrap();
        assert_eq!(storage.backend, StorageBackend::Local);
        assert!(!storage.allow_http);
    }
}
