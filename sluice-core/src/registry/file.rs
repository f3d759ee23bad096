//! Directory-backed registry.
//!
//! ```text
//! <root>/<namespace>/triggers/<name>.json          {labels, spec}
//! <root>/<namespace>/triggers/<name>.status.json   {lastPolled}
//! <root>/<namespace>/functions/<name>.json         {labels, port}
//! ```
//!
//! Spec and status live in separate files so status writes never rewrite a
//! manifest someone may be editing by hand. A refresh task re-reads the tree
//! and broadcasts the difference against the last snapshot.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{
    fs,
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FunctionDirectory, TriggerRegistry, WATCH_CHANNEL_CAPACITY, WatchEvent};
use crate::{
    config::RegistryConfig,
    error::{Result, SluiceError},
    types::{Function, Trigger, TriggerKey, TriggerSpec, TriggerStatus},
};

const TRIGGERS_DIR: &str = "triggers";
const FUNCTIONS_DIR: &str = "functions";
const MANIFEST_SUFFIX: &str = ".json";
const STATUS_SUFFIX: &str = ".status.json";

type FunctionKey = (String, String);

#[derive(Debug, Serialize, Deserialize)]
struct TriggerDocument {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    spec: TriggerSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionDocument {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

#[derive(Debug, Default)]
struct Snapshot {
    triggers: BTreeMap<TriggerKey, Trigger>,
    functions: BTreeMap<FunctionKey, Function>,
    /// Manifests present on disk that failed to read or parse.
    unreadable_triggers: BTreeSet<TriggerKey>,
    unreadable_functions: BTreeSet<FunctionKey>,
}

impl Snapshot {
    /// Carry the last good entry forward for every manifest that is present
    /// but unreadable, so a bad hand edit never reads as a deletion.
    fn keep_last_good(&mut self, previous: &Snapshot) {
        for key in &self.unreadable_triggers {
            let Some(last_good) = previous.triggers.get(key) else {
                continue;
            };
            if !previous.unreadable_triggers.contains(key) {
                error!(
                    target: "sluice::registry",
                    trigger = %key,
                    "trigger manifest is malformed; keeping the last good version"
                );
            }
            self.triggers.insert(key.clone(), last_good.clone());
        }
        for key in &self.unreadable_functions {
            let Some(last_good) = previous.functions.get(key) else {
                continue;
            };
            if !previous.unreadable_functions.contains(key) {
                error!(
                    target: "sluice::registry",
                    namespace = %key.0,
                    function = %key.1,
                    "function manifest is malformed; keeping the last good version"
                );
            }
            self.functions.insert(key.clone(), last_good.clone());
        }
    }
}

enum Document<T> {
    Parsed(T),
    Absent,
    Unusable,
}

pub struct FileTriggerRegistry {
    root: PathBuf,
    refresh_interval: Duration,
    state: Mutex<Snapshot>,
    trigger_events: broadcast::Sender<WatchEvent<Trigger>>,
    function_events: broadcast::Sender<WatchEvent<Function>>,
}

impl fmt::Debug for FileTriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTriggerRegistry")
            .field("root", &self.root)
            .field("refresh_interval", &self.refresh_interval)
            .field("trigger_watchers", &self.trigger_events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl FileTriggerRegistry {
    /// Load the tree under `config.root`. A missing root is an error; there
    /// is no degraded start.
    pub async fn open(config: &RegistryConfig) -> Result<Self> {
        let root = config.root.clone();
        let metadata = fs::metadata(&root).await.map_err(|err| {
            SluiceError::NotFound(format!(
                "registry root {} is not accessible: {err}",
                root.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(SluiceError::NotFound(format!(
                "registry root {} is not a directory",
                root.display()
            )));
        }

        let snapshot = read_tree(&root).await?;
        info!(
            target: "sluice::registry",
            root = %root.display(),
            triggers = snapshot.triggers.len(),
            functions = snapshot.functions.len(),
            "opened file registry"
        );

        let (trigger_events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let (function_events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Ok(Self {
            root,
            refresh_interval: config.refresh_interval(),
            state: Mutex::new(snapshot),
            trigger_events,
            function_events,
        })
    }

    /// Re-read the tree and broadcast what changed since the last snapshot.
    /// Returns the number of events emitted.
    pub async fn refresh(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut next = read_tree(&self.root).await?;
        next.keep_last_good(&state);

        let trigger_changes = diff(&state.triggers, &next.triggers);
        let function_changes = diff(&state.functions, &next.functions);
        let emitted = trigger_changes.len() + function_changes.len();

        for event in function_changes {
            let _ = self.function_events.send(event);
        }
        for event in trigger_changes {
            let _ = self.trigger_events.send(event);
        }
        *state = next;

        if emitted > 0 {
            debug!(target: "sluice::registry", changes = emitted, "registry refreshed");
        }
        Ok(emitted)
    }

    /// Periodically [`refresh`](Self::refresh) until `shutdown` fires.
    pub fn spawn_refresh(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = registry.refresh().await {
                            warn!(
                                target: "sluice::registry",
                                root = %registry.root.display(),
                                error = %err,
                                "registry refresh failed"
                            );
                        }
                    }
                }
            }
            debug!(target: "sluice::registry", "registry refresh stopped");
        })
    }

    /// Create or replace a function manifest.
    pub async fn put_function(&self, function: Function) -> Result<()> {
        TriggerKey::new(function.namespace.clone(), function.name.clone()).validate()?;
        let mut state = self.state.lock().await;
        let document = FunctionDocument {
            labels: function.labels.clone(),
            port: function.port,
        };
        write_json(&self.function_path(&function.namespace, &function.name), &document)
            .await?;

        let key = (function.namespace.clone(), function.name.clone());
        let event = match state.functions.insert(key, function.clone()) {
            Some(_) => WatchEvent::Modified(function),
            None => WatchEvent::Added(function),
        };
        let _ = self.function_events.send(event);
        Ok(())
    }

    pub async fn delete_function(&self, namespace: &str, name: &str) -> Result<Function> {
        let mut state = self.state.lock().await;
        let key = (namespace.to_string(), name.to_string());
        let Some(removed) = state.functions.remove(&key) else {
            return Err(SluiceError::NotFound(format!("function {namespace}/{name}")));
        };
        remove_if_present(&self.function_path(namespace, name)).await?;
        let _ = self.function_events.send(WatchEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    fn trigger_dir(&self, key: &TriggerKey) -> PathBuf {
        self.root.join(&key.namespace).join(TRIGGERS_DIR)
    }

    fn manifest_path(&self, key: &TriggerKey) -> PathBuf {
        self.trigger_dir(key)
            .join(format!("{}{MANIFEST_SUFFIX}", key.name))
    }

    fn status_path(&self, key: &TriggerKey) -> PathBuf {
        self.trigger_dir(key).join(format!("{}{STATUS_SUFFIX}", key.name))
    }

    fn function_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(FUNCTIONS_DIR)
            .join(format!("{name}{MANIFEST_SUFFIX}"))
    }

    async fn write_manifest(&self, trigger: &Trigger) -> Result<()> {
        let document = TriggerDocument {
            labels: trigger.labels.clone(),
            spec: trigger.spec.clone(),
        };
        write_json(&self.manifest_path(&trigger.key), &document).await
    }
}

#[async_trait]
impl TriggerRegistry for FileTriggerRegistry {
    async fn get(&self, key: &TriggerKey) -> Result<Trigger> {
        let state = self.state.lock().await;
        state
            .triggers
            .get(key)
            .cloned()
            .ok_or_else(|| SluiceError::NotFound(format!("trigger {key}")))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Trigger>> {
        let state = self.state.lock().await;
        Ok(state
            .triggers
            .values()
            .filter(|t| namespace.is_none_or(|ns| t.key.namespace == ns))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<Trigger>> {
        self.trigger_events.subscribe()
    }

    async fn create(&self, trigger: Trigger) -> Result<Trigger> {
        trigger.key.validate()?;
        let mut state = self.state.lock().await;
        if state.triggers.contains_key(&trigger.key)
            || fs::try_exists(self.manifest_path(&trigger.key)).await?
        {
            return Err(SluiceError::Conflict(format!(
                "trigger {} already exists",
                trigger.key
            )));
        }

        self.write_manifest(&trigger).await?;
        if trigger.status.last_polled.is_some() {
            write_json(&self.status_path(&trigger.key), &trigger.status).await?;
        }

        state.triggers.insert(trigger.key.clone(), trigger.clone());
        let _ = self.trigger_events.send(WatchEvent::Added(trigger.clone()));
        Ok(trigger)
    }

    async fn update(&self, trigger: Trigger) -> Result<Trigger> {
        let mut state = self.state.lock().await;
        let Some(current) = state.triggers.get(&trigger.key) else {
            return Err(SluiceError::NotFound(format!("trigger {}", trigger.key)));
        };
        let updated = Trigger {
            status: current.status.clone(),
            ..trigger
        };

        self.write_manifest(&updated).await?;
        state.triggers.insert(updated.key.clone(), updated.clone());
        let _ = self.trigger_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &TriggerKey) -> Result<Trigger> {
        let mut state = self.state.lock().await;
        let Some(removed) = state.triggers.remove(key) else {
            return Err(SluiceError::NotFound(format!("trigger {key}")));
        };

        remove_if_present(&self.manifest_path(key)).await?;
        remove_if_present(&self.status_path(key)).await?;
        let _ = self.trigger_events.send(WatchEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    async fn update_status(
        &self,
        key: &TriggerKey,
        status: TriggerStatus,
    ) -> Result<Trigger> {
        let mut state = self.state.lock().await;
        let Some(current) = state.triggers.get_mut(key) else {
            return Err(SluiceError::NotFound(format!("trigger {key}")));
        };

        write_json(&self.status_path(key), &status).await?;
        current.status = status;
        let updated = current.clone();
        let _ = self.trigger_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }
}

#[async_trait]
impl FunctionDirectory for FileTriggerRegistry {
    async fn list_functions(&self, namespace: &str) -> Result<Vec<Function>> {
        let state = self.state.lock().await;
        Ok(state
            .functions
            .values()
            .filter(|f| f.namespace == namespace)
            .cloned()
            .collect())
    }

    fn watch_functions(&self) -> broadcast::Receiver<WatchEvent<Function>> {
        self.function_events.subscribe()
    }
}

/// Write via a hidden temp file and rename so readers never see a partial
/// document.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        SluiceError::Internal(format!("{} has no parent directory", path.display()))
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| SluiceError::Internal(format!("{} has no file name", path.display())))?;

    fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(".{file_name}.tmp"));
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Document<T> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Document::Absent,
        Err(err) => {
            warn!(target: "sluice::registry", path = %path.display(), error = %err, "unreadable manifest");
            return Document::Unusable;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Document::Parsed(value),
        Err(err) => {
            warn!(target: "sluice::registry", path = %path.display(), error = %err, "malformed manifest");
            Document::Unusable
        }
    }
}

/// Visible `*.json` entries in `dir` as `(stem, path)`, status files excluded.
async fn manifests(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if file_name.starts_with('.') || file_name.ends_with(STATUS_SUFFIX) {
            continue;
        }
        if let Some(stem) = file_name.strip_suffix(MANIFEST_SUFFIX)
            && entry.file_type().await?.is_file()
        {
            found.push((stem.to_string(), entry.path()));
        }
    }
    Ok(found)
}

async fn read_tree(root: &Path) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    let mut namespaces = fs::read_dir(root).await?;

    while let Some(entry) = namespaces.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(namespace) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if namespace.starts_with('.') {
            continue;
        }
        let ns_dir = entry.path();

        let trigger_dir = ns_dir.join(TRIGGERS_DIR);
        for (name, path) in manifests(&trigger_dir).await? {
            let key = TriggerKey::new(namespace.clone(), name.clone());
            let document = match read_document::<TriggerDocument>(&path).await {
                Document::Parsed(document) => document,
                Document::Absent => continue,
                Document::Unusable => {
                    snapshot.unreadable_triggers.insert(key);
                    continue;
                }
            };
            let status_path = trigger_dir.join(format!("{name}{STATUS_SUFFIX}"));
            let status = match read_document::<TriggerStatus>(&status_path).await {
                Document::Parsed(status) => status,
                Document::Absent | Document::Unusable => TriggerStatus::default(),
            };

            snapshot.triggers.insert(
                key.clone(),
                Trigger {
                    key,
                    labels: document.labels,
                    spec: document.spec,
                    status,
                },
            );
        }

        for (name, path) in manifests(&ns_dir.join(FUNCTIONS_DIR)).await? {
            let document = match read_document::<FunctionDocument>(&path).await {
                Document::Parsed(document) => document,
                Document::Absent => continue,
                Document::Unusable => {
                    snapshot.unreadable_functions.insert((namespace.clone(), name));
                    continue;
                }
            };
            snapshot.functions.insert(
                (namespace.clone(), name.clone()),
                Function {
                    namespace: namespace.clone(),
                    name,
                    labels: document.labels,
                    port: document.port,
                },
            );
        }
    }

    Ok(snapshot)
}

fn diff<K: Ord, T: Clone + PartialEq>(
    previous: &BTreeMap<K, T>,
    next: &BTreeMap<K, T>,
) -> Vec<WatchEvent<T>> {
    let mut events = Vec::new();
    for (key, value) in next {
        match previous.get(key) {
            None => events.push(WatchEvent::Added(value.clone())),
            Some(old) if old != value => events.push(WatchEvent::Modified(value.clone())),
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        if !next.contains_key(key) {
            events.push(WatchEvent::Deleted(value.clone()));
        }
    }
    events
}
