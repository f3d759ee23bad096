use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::{FunctionDirectory, TriggerRegistry, WATCH_CHANNEL_CAPACITY, WatchEvent};
use crate::{
    error::{Result, SluiceError},
    types::{Function, Trigger, TriggerKey, TriggerStatus},
};

type FunctionKey = (String, String);

/// Process-local registry. Writes broadcast to every watcher before they
/// return.
pub struct InMemoryTriggerRegistry {
    triggers: RwLock<BTreeMap<TriggerKey, Trigger>>,
    functions: RwLock<BTreeMap<FunctionKey, Function>>,
    trigger_events: broadcast::Sender<WatchEvent<Trigger>>,
    function_events: broadcast::Sender<WatchEvent<Function>>,
}

impl fmt::Debug for InMemoryTriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTriggerRegistry")
            .field("trigger_watchers", &self.trigger_events.receiver_count())
            .field("function_watchers", &self.function_events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryTriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTriggerRegistry {
    pub fn new() -> Self {
        let (trigger_events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let (function_events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            triggers: RwLock::new(BTreeMap::new()),
            functions: RwLock::new(BTreeMap::new()),
            trigger_events,
            function_events,
        }
    }

    /// Create or replace a function.
    pub async fn put_function(&self, function: Function) {
        let key = (function.namespace.clone(), function.name.clone());
        let previous = self
            .functions
            .write()
            .await
            .insert(key, function.clone());
        let event = match previous {
            Some(_) => WatchEvent::Modified(function),
            None => WatchEvent::Added(function),
        };
        let _ = self.function_events.send(event);
    }

    pub async fn delete_function(&self, namespace: &str, name: &str) -> Option<Function> {
        let removed = self
            .functions
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        if let Some(function) = &removed {
            let _ = self.function_events.send(WatchEvent::Deleted(function.clone()));
        }
        removed
    }

    fn publish(&self, event: WatchEvent<Trigger>) {
        // No subscribers is fine.
        let _ = self.trigger_events.send(event);
    }
}

#[async_trait]
impl TriggerRegistry for InMemoryTriggerRegistry {
    async fn get(&self, key: &TriggerKey) -> Result<Trigger> {
        self.triggers
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| SluiceError::NotFound(format!("trigger {key}")))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Trigger>> {
        let triggers = self.triggers.read().await;
        Ok(triggers
            .values()
            .filter(|t| namespace.is_none_or(|ns| t.key.namespace == ns))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<Trigger>> {
        self.trigger_events.subscribe()
    }

    async fn create(&self, trigger: Trigger) -> Result<Trigger> {
        let mut triggers = self.triggers.write().await;
        if triggers.contains_key(&trigger.key) {
            return Err(SluiceError::Conflict(format!(
                "trigger {} already exists",
                trigger.key
            )));
        }
        triggers.insert(trigger.key.clone(), trigger.clone());
        self.publish(WatchEvent::Added(trigger.clone()));
        Ok(trigger)
    }

    async fn update(&self, trigger: Trigger) -> Result<Trigger> {
        let mut triggers = self.triggers.write().await;
        let Some(current) = triggers.get_mut(&trigger.key) else {
            return Err(SluiceError::NotFound(format!("trigger {}", trigger.key)));
        };
        current.spec = trigger.spec;
        current.labels = trigger.labels;
        let updated = current.clone();
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &TriggerKey) -> Result<Trigger> {
        let removed = self
            .triggers
            .write()
            .await
            .remove(key)
            .ok_or_else(|| SluiceError::NotFound(format!("trigger {key}")))?;
        self.publish(WatchEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    async fn update_status(
        &self,
        key: &TriggerKey,
        status: TriggerStatus,
    ) -> Result<Trigger> {
        let mut triggers = self.triggers.write().await;
        let Some(current) = triggers.get_mut(key) else {
            return Err(SluiceError::NotFound(format!("trigger {key}")));
        };
        current.status = status;
        let updated = current.clone();
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }
}

#[async_trait]
impl FunctionDirectory for InMemoryTriggerRegistry {
    async fn list_functions(&self, namespace: &str) -> Result<Vec<Function>> {
        let functions = self.functions.read().await;
        Ok(functions
            .values()
            .filter(|f| f.namespace == namespace)
            .cloned()
            .collect())
    }

    fn watch_functions(&self) -> broadcast::Receiver<WatchEvent<Function>> {
        self.function_events.subscribe()
    }
}
