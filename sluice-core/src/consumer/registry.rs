use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConsumerIdentity, ConsumerParams, Poller};
use crate::{
    checkpoint::{CheckpointPublisher, CheckpointReader},
    config::ConsumerSettings,
    dispatch::{Dispatcher, FunctionInvoker},
    storage::Scanner,
};

/// Shared collaborators every poller is built from.
#[derive(Clone)]
pub struct ConsumerDeps {
    pub scanner: Scanner,
    pub invoker: Arc<dyn FunctionInvoker>,
    pub checkpoints: Arc<dyn CheckpointReader>,
    pub publisher: CheckpointPublisher,
    pub settings: ConsumerSettings,
}

impl fmt::Debug for ConsumerDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDeps")
            .field("scanner", &self.scanner)
            .field("publisher", &self.publisher)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A new poller was spawned.
    Started,
    /// Already running with the same parameters.
    AlreadyActive,
    /// Already running; the new poll interval was pushed to it.
    Retuned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Stopped,
    NotActive,
}

/// Lifecycle handles of one running poller.
struct ConsumerHandle {
    params: ConsumerParams,
    stop: CancellationToken,
    stopped: oneshot::Receiver<()>,
    interval: watch::Sender<Duration>,
    started_at: DateTime<Utc>,
}

impl ConsumerHandle {
    /// True once the poller task has finished, normally or by panicking.
    fn has_exited(&mut self) -> bool {
        !matches!(
            self.stopped.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }

    /// Signal stop and wait for the acknowledgement.
    async fn drain(self) {
        self.stop.cancel();
        // A dropped sender also means the task is gone.
        let _ = self.stopped.await;
    }
}

/// Owns every running poller, at most one per [`ConsumerIdentity`].
///
/// `ensure` and `remove` hold the active-set lock for their whole duration,
/// including the wait for a stopping poller to acknowledge. A `remove`
/// therefore completes before any later `ensure` of the same identity
/// starts.
pub struct ConsumerRegistry {
    deps: ConsumerDeps,
    active: Mutex<HashMap<ConsumerIdentity, ConsumerHandle>>,
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .active
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("ConsumerRegistry")
            .field("deps", &self.deps)
            .field("active", &active)
            .finish()
    }
}

impl ConsumerRegistry {
    pub fn new(deps: ConsumerDeps) -> Self {
        Self {
            deps,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a poller for `identity` unless one is already running.
    ///
    /// A running poller whose function endpoint changed is drained and
    /// replaced; one whose task already died is replaced outright.
    pub async fn ensure(
        &self,
        identity: ConsumerIdentity,
        params: ConsumerParams,
    ) -> EnsureOutcome {
        let mut active = self.active.lock().await;

        if let Some(handle) = active.get_mut(&identity) {
            if handle.has_exited() {
                warn!(
                    target: "sluice::consumers",
                    consumer = %identity,
                    started_at = %handle.started_at,
                    "poller exited unexpectedly; restarting"
                );
                active.remove(&identity);
            } else if handle.params.function != params.function {
                info!(
                    target: "sluice::consumers",
                    consumer = %identity,
                    function = %params.function,
                    "function endpoint changed; restarting poller"
                );
                if let Some(previous) = active.remove(&identity) {
                    previous.drain().await;
                }
            } else if handle.params.poll_interval != params.poll_interval {
                info!(
                    target: "sluice::consumers",
                    consumer = %identity,
                    from = ?handle.params.poll_interval,
                    to = ?params.poll_interval,
                    "poll interval changed"
                );
                handle.interval.send_replace(params.poll_interval);
                handle.params = params;
                return EnsureOutcome::Retuned;
            } else {
                debug!(
                    target: "sluice::consumers",
                    consumer = %identity,
                    "consumer already active"
                );
                return EnsureOutcome::AlreadyActive;
            }
        }

        let handle = self.spawn(identity.clone(), params);
        info!(
            target: "sluice::consumers",
            consumer = %identity,
            active = active.len() + 1,
            "consumer started"
        );
        active.insert(identity, handle);
        EnsureOutcome::Started
    }

    /// Stop the poller for `identity` and wait until it has fully exited.
    pub async fn remove(&self, identity: &ConsumerIdentity) -> RemoveOutcome {
        let mut active = self.active.lock().await;
        let Some(handle) = active.remove(identity) else {
            debug!(
                target: "sluice::consumers",
                consumer = %identity,
                "consumer not active; nothing to remove"
            );
            return RemoveOutcome::NotActive;
        };

        handle.drain().await;
        info!(
            target: "sluice::consumers",
            consumer = %identity,
            active = active.len(),
            "consumer stopped"
        );
        RemoveOutcome::Stopped
    }

    /// Stop every poller. All are signalled first, then awaited.
    pub async fn shutdown(&self) -> usize {
        let mut active = self.active.lock().await;
        let handles: Vec<_> = active.drain().collect();
        for (_, handle) in &handles {
            handle.stop.cancel();
        }

        let stopped = handles.len();
        for (identity, handle) in handles {
            handle.drain().await;
            debug!(target: "sluice::consumers", consumer = %identity, "consumer drained");
        }
        if stopped > 0 {
            info!(target: "sluice::consumers", stopped, "all consumers stopped");
        }
        stopped
    }

    /// Identities of running pollers, sorted.
    pub async fn active(&self) -> Vec<ConsumerIdentity> {
        let active = self.active.lock().await;
        let mut identities: Vec<_> = active.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn is_active(&self, identity: &ConsumerIdentity) -> bool {
        self.active.lock().await.contains_key(identity)
    }

    pub async fn params(&self, identity: &ConsumerIdentity) -> Option<ConsumerParams> {
        self.active
            .lock()
            .await
            .get(identity)
            .map(|handle| handle.params.clone())
    }

    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn spawn(&self, identity: ConsumerIdentity, params: ConsumerParams) -> ConsumerHandle {
        let stop = CancellationToken::new();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let (interval_tx, interval_rx) = watch::channel(params.poll_interval);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.deps.invoker),
            params.function.clone(),
            identity.clone(),
        );
        let poller = Poller::new(identity, &self.deps, dispatcher, interval_rx, stop.clone());
        tokio::spawn(poller.run(stopped_tx));

        ConsumerHandle {
            params,
            stop,
            stopped: stopped_rx,
            interval: interval_tx,
            started_at: Utc::now(),
        }
    }
}
