//! Registry collaborators: where triggers and functions are declared and how
//! changes to them are observed.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    error::Result,
    types::{Function, Trigger, TriggerKey, TriggerStatus},
};

pub mod file;
pub mod memory;

pub use file::FileTriggerRegistry;
pub use memory::InMemoryTriggerRegistry;

/// Buffered notifications per subscriber before it observes `Lagged`.
pub const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Change notification for a watched resource. `Deleted` carries the last
/// state the registry held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Typed access to trigger resources.
///
/// `update` replaces spec and labels and preserves status; `update_status`
/// replaces status and never touches the spec, so checkpoint writes cannot
/// clobber a concurrent spec edit.
#[async_trait]
pub trait TriggerRegistry: Send + Sync {
    /// `NotFound` when the trigger does not exist.
    async fn get(&self, key: &TriggerKey) -> Result<Trigger>;

    /// All triggers, or only those in `namespace`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Trigger>>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<Trigger>>;

    /// `Conflict` when the key is already taken.
    async fn create(&self, trigger: Trigger) -> Result<Trigger>;

    async fn update(&self, trigger: Trigger) -> Result<Trigger>;

    async fn delete(&self, key: &TriggerKey) -> Result<Trigger>;

    async fn update_status(
        &self,
        key: &TriggerKey,
        status: TriggerStatus,
    ) -> Result<Trigger>;
}

/// Functions that triggers resolve through their label selector.
#[async_trait]
pub trait FunctionDirectory: Send + Sync {
    async fn list_functions(&self, namespace: &str) -> Result<Vec<Function>>;

    fn watch_functions(&self) -> broadcast::Receiver<WatchEvent<Function>>;
}
