//! Checkpoints are the `lastPolled` boundary of a trigger: objects modified at
//! or before it count as delivered.
//!
//! Pollers publish advances through a [`CheckpointPublisher`], which records
//! them in the shared [`CheckpointBook`] before queueing them for the
//! [`CheckpointWriter`]. The writer is the only component that touches trigger
//! status. Readers combine the book with the persisted status so a consumer
//! restarted mid-process resumes from the newest value either side knows.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::{
    consumer::ConsumerIdentity,
    error::{Result, SluiceError},
    registry::TriggerRegistry,
    types::{TriggerKey, TriggerStatus},
};

/// Render a checkpoint as ISO-8601 UTC with millisecond precision.
pub fn format(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| SluiceError::InvalidTimestamp(format!("{raw}: {err}")))
}

/// Drop sub-millisecond precision so in-memory and persisted values agree.
pub fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// A poller finished a scan cycle; everything up to `at` has been handed to
/// dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointAdvance {
    pub trigger: TriggerKey,
    pub consumer: ConsumerIdentity,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointReader: Send + Sync {
    /// Newest known checkpoint for `trigger`, `None` if it was never polled.
    async fn read(&self, trigger: &TriggerKey) -> Result<Option<DateTime<Utc>>>;
}

/// In-process view of the newest checkpoint per trigger, updated as soon as a
/// poller publishes and before the status write lands.
#[derive(Clone, Default, Debug)]
pub struct CheckpointBook {
    inner: Arc<Mutex<HashMap<TriggerKey, DateTime<Utc>>>>,
}

impl CheckpointBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the maximum of the stored and offered value. Returns true when
    /// `at` moved the checkpoint forward.
    pub async fn record(&self, trigger: &TriggerKey, at: DateTime<Utc>) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.get_mut(trigger) {
            Some(current) if *current >= at => false,
            Some(current) => {
                *current = at;
                true
            }
            None => {
                guard.insert(trigger.clone(), at);
                true
            }
        }
    }

    pub async fn latest(&self, trigger: &TriggerKey) -> Option<DateTime<Utc>> {
        let guard = self.inner.lock().await;
        guard.get(trigger).copied()
    }

    pub async fn forget(&self, trigger: &TriggerKey) -> Option<DateTime<Utc>> {
        let mut guard = self.inner.lock().await;
        guard.remove(trigger)
    }
}

/// Sending half handed to every poller.
#[derive(Clone, Debug)]
pub struct CheckpointPublisher {
    tx: mpsc::Sender<CheckpointAdvance>,
    book: CheckpointBook,
}

impl CheckpointPublisher {
    pub fn new(tx: mpsc::Sender<CheckpointAdvance>, book: CheckpointBook) -> Self {
        Self { tx, book }
    }

    /// Record the advance and queue it for persistence. Returns false when
    /// `stop` fired while waiting for channel capacity or the writer is gone;
    /// the book is updated either way.
    pub async fn publish(
        &self,
        advance: CheckpointAdvance,
        stop: &CancellationToken,
    ) -> bool {
        self.book.record(&advance.trigger, advance.at).await;

        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            sent = self.tx.send(advance) => match sent {
                Ok(()) => true,
                Err(err) => {
                    error!(
                        target: "sluice::checkpoint",
                        trigger = %err.0.trigger,
                        "checkpoint writer is gone; advance not persisted"
                    );
                    false
                }
            },
        }
    }
}

/// Reads `max(book, persisted status)`.
pub struct RegistryCheckpointReader {
    registry: Arc<dyn TriggerRegistry>,
    book: CheckpointBook,
}

impl fmt::Debug for RegistryCheckpointReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCheckpointReader")
            .field("book", &self.book)
            .finish()
    }
}

impl RegistryCheckpointReader {
    pub fn new(registry: Arc<dyn TriggerRegistry>, book: CheckpointBook) -> Self {
        Self { registry, book }
    }
}

#[async_trait]
impl CheckpointReader for RegistryCheckpointReader {
    async fn read(&self, trigger: &TriggerKey) -> Result<Option<DateTime<Utc>>> {
        let cached = self.book.latest(trigger).await;
        let persisted = match self.registry.get(trigger).await {
            Ok(current) => current.status.checkpoint(),
            Err(err) if err.is_not_found() => None,
            Err(err) if cached.is_some() => {
                debug!(
                    target: "sluice::checkpoint",
                    trigger = %trigger,
                    error = %err,
                    "status read failed; using in-process checkpoint"
                );
                None
            }
            Err(err) => return Err(err),
        };
        Ok(cached.max(persisted))
    }
}

/// Single task persisting checkpoint advances to trigger status.
pub struct CheckpointWriter {
    registry: Arc<dyn TriggerRegistry>,
    rx: mpsc::Receiver<CheckpointAdvance>,
    persisted: HashMap<TriggerKey, DateTime<Utc>>,
}

impl fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("persisted", &self.persisted.len())
            .finish()
    }
}

impl CheckpointWriter {
    pub fn new(
        registry: Arc<dyn TriggerRegistry>,
        rx: mpsc::Receiver<CheckpointAdvance>,
    ) -> Self {
        Self {
            registry,
            rx,
            persisted: HashMap::new(),
        }
    }

    /// Runs until every publisher has been dropped.
    pub async fn run(self) {
        self.run_until(CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but once `stop` fires the channel is closed,
    /// whatever is already queued is persisted, and the writer exits.
    pub async fn run_until(mut self, stop: CancellationToken) {
        let mut closing = false;
        loop {
            let received = if closing {
                self.rx.recv().await
            } else {
                tokio::select! {
                    biased;
                    received = self.rx.recv() => received,
                    _ = stop.cancelled() => {
                        self.rx.close();
                        closing = true;
                        continue;
                    }
                }
            };
            let Some(first) = received else {
                break;
            };

            let mut batch: HashMap<TriggerKey, DateTime<Utc>> = HashMap::new();
            coalesce(&mut batch, first);
            while let Ok(next) = self.rx.try_recv() {
                coalesce(&mut batch, next);
            }

            for (trigger, at) in batch {
                self.persist(trigger, at).await;
            }
        }

        info!(target: "sluice::checkpoint", "checkpoint writer drained");
    }

    async fn persist(&mut self, trigger: TriggerKey, at: DateTime<Utc>) {
        if self.persisted.get(&trigger).is_some_and(|prev| *prev >= at) {
            trace!(target: "sluice::checkpoint", trigger = %trigger, "advance already persisted");
            return;
        }

        let current = match self.registry.get(&trigger).await {
            Ok(current) => current,
            Err(err) if err.is_not_found() => {
                debug!(
                    target: "sluice::checkpoint",
                    trigger = %trigger,
                    "trigger deleted before its checkpoint was written"
                );
                self.persisted.remove(&trigger);
                return;
            }
            Err(err) => {
                error!(
                    target: "sluice::checkpoint",
                    trigger = %trigger,
                    error = %err,
                    "failed to read trigger status"
                );
                return;
            }
        };

        if let Some(stored) = current.status.checkpoint()
            && stored >= at
        {
            self.persisted.insert(trigger, stored);
            return;
        }

        match self
            .registry
            .update_status(&trigger, TriggerStatus::at(at))
            .await
        {
            Ok(_) => {
                debug!(
                    target: "sluice::checkpoint",
                    trigger = %trigger,
                    last_polled = %format(at),
                    "checkpoint persisted"
                );
                self.persisted.insert(trigger, at);
            }
            Err(err) if err.is_not_found() => {
                debug!(
                    target: "sluice::checkpoint",
                    trigger = %trigger,
                    "trigger deleted before its checkpoint was written"
                );
                self.persisted.remove(&trigger);
            }
            Err(err) => {
                error!(
                    target: "sluice::checkpoint",
                    trigger = %trigger,
                    last_polled = %format(at),
                    error = %err,
                    "failed to persist checkpoint"
                );
            }
        }
    }
}

fn coalesce(
    batch: &mut HashMap<TriggerKey, DateTime<Utc>>,
    advance: CheckpointAdvance,
) {
    batch
        .entry(advance.trigger)
        .and_modify(|at| *at = (*at).max(advance.at))
        .or_insert(advance.at);
}
