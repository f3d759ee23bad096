//! Keeps running consumers aligned with declared triggers.
//!
//! Per trigger the reconciler remembers the last spec it acted on and the
//! consumers derived from it. A trigger binds one consumer per function whose
//! labels match its selector. Changing a component of a consumer identity
//! (bucket, prefix, matched function) removes the old consumer before the new
//! one is ensured; an interval-only change retunes the running poller.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    ops::AddAssign,
    sync::Arc,
};

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::CheckpointBook,
    config::ReconcilerConfig,
    consumer::{ConsumerIdentity, ConsumerParams, ConsumerRegistry, EnsureOutcome, RemoveOutcome},
    error::Result,
    registry::{FunctionDirectory, TriggerRegistry, WatchEvent},
    types::{Function, Trigger, TriggerKey, TriggerSpec},
};

/// Lifecycle of one trigger as seen by the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerPhase {
    /// Unknown, or deleted and fully drained.
    Absent,
    /// Valid spec; consumers ensured for every matching function.
    Active,
    /// Consumers removed or being removed. Deleted triggers pass through this
    /// on their way back to `Absent`; rejected triggers stay here until a
    /// valid spec arrives.
    Removed,
}

/// What a reconcile pass did to the consumer set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: usize,
    pub retuned: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.started == 0 && self.retuned == 0 && self.removed == 0
    }

    fn record_ensure(&mut self, outcome: EnsureOutcome) {
        match outcome {
            EnsureOutcome::Started => self.started += 1,
            EnsureOutcome::Retuned => self.retuned += 1,
            EnsureOutcome::AlreadyActive => self.unchanged += 1,
        }
    }

    fn record_remove(&mut self, outcome: RemoveOutcome) {
        if outcome == RemoveOutcome::Stopped {
            self.removed += 1;
        }
    }
}

impl AddAssign for ReconcileSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.started += rhs.started;
        self.retuned += rhs.retuned;
        self.unchanged += rhs.unchanged;
        self.removed += rhs.removed;
    }
}

#[derive(Debug)]
struct KnownTrigger {
    spec: TriggerSpec,
    valid: bool,
    consumers: BTreeMap<ConsumerIdentity, ConsumerParams>,
}

/// Watch streams the reconcile loop consumes. Subscribe before the initial
/// resync so no change between listing and watching is lost.
#[derive(Debug)]
pub struct Subscriptions {
    pub triggers: broadcast::Receiver<WatchEvent<Trigger>>,
    pub functions: broadcast::Receiver<WatchEvent<Function>>,
}

pub struct Reconciler {
    registry: Arc<dyn TriggerRegistry>,
    functions: Arc<dyn FunctionDirectory>,
    consumers: Arc<ConsumerRegistry>,
    book: CheckpointBook,
    config: ReconcilerConfig,
    known: Mutex<HashMap<TriggerKey, KnownTrigger>>,
    phases: RwLock<HashMap<TriggerKey, TriggerPhase>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = self
            .known
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("Reconciler")
            .field("consumers", &self.consumers)
            .field("config", &self.config)
            .field("known_triggers", &known)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn TriggerRegistry>,
        functions: Arc<dyn FunctionDirectory>,
        consumers: Arc<ConsumerRegistry>,
        book: CheckpointBook,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            functions,
            consumers,
            book,
            config,
            known: Mutex::new(HashMap::new()),
            phases: RwLock::new(HashMap::new()),
        }
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.consumers
    }

    pub fn subscribe(&self) -> Subscriptions {
        Subscriptions {
            triggers: self.registry.watch(),
            functions: self.functions.watch_functions(),
        }
    }

    pub async fn phase(&self, key: &TriggerKey) -> TriggerPhase {
        self.phases
            .read()
            .await
            .get(key)
            .copied()
            .unwrap_or(TriggerPhase::Absent)
    }

    /// Reconcile one trigger from an add or update notification. A spec
    /// identical to the last one acted on is a no-op, which is what
    /// status-only updates look like.
    pub async fn apply(&self, trigger: &Trigger) -> Result<ReconcileSummary> {
        self.reconcile(&trigger.key, &trigger.spec, false).await
    }

    /// Remove every consumer derived from the last-known spec of `key`.
    pub async fn forget(&self, key: &TriggerKey) -> ReconcileSummary {
        let mut known = self.known.lock().await;
        let Some(entry) = known.remove(key) else {
            debug!(target: "sluice::reconciler", trigger = %key, "delete for unknown trigger");
            return ReconcileSummary::default();
        };

        self.set_phase(key, TriggerPhase::Removed).await;
        let mut summary = ReconcileSummary::default();
        for identity in entry.consumers.keys() {
            summary.record_remove(self.consumers.remove(identity).await);
        }
        self.book.forget(key).await;
        self.phases.write().await.remove(key);

        info!(
            target: "sluice::reconciler",
            trigger = %key,
            removed = summary.removed,
            "trigger deleted"
        );
        summary
    }

    /// Re-resolve every valid trigger in `namespace` after a function
    /// changed.
    pub async fn functions_changed(&self, namespace: &str) -> ReconcileSummary {
        let targets: Vec<(TriggerKey, TriggerSpec)> = {
            let known = self.known.lock().await;
            known
                .iter()
                .filter(|(key, entry)| key.namespace == namespace && entry.valid)
                .map(|(key, entry)| (key.clone(), entry.spec.clone()))
                .collect()
        };

        let mut summary = ReconcileSummary::default();
        for (key, spec) in targets {
            match self.reconcile(&key, &spec, true).await {
                Ok(done) => summary += done,
                Err(err) => warn!(
                    target: "sluice::reconciler",
                    trigger = %key,
                    error = %err,
                    "failed to re-resolve functions"
                ),
            }
        }
        summary
    }

    /// Full list-and-diff. Listing failure is returned; per-trigger failures
    /// are logged. Forced reconciles also replace consumers whose poller died.
    pub async fn resync(&self) -> Result<ReconcileSummary> {
        let triggers = self.registry.list(None).await?;
        let listed: HashSet<TriggerKey> = triggers.iter().map(|t| t.key.clone()).collect();

        let mut summary = ReconcileSummary::default();
        for trigger in &triggers {
            match self.reconcile(&trigger.key, &trigger.spec, true).await {
                Ok(done) => summary += done,
                Err(err) => debug!(
                    target: "sluice::reconciler",
                    trigger = %trigger.key,
                    error = %err,
                    "trigger not reconciled during resync"
                ),
            }
        }

        let vanished: Vec<TriggerKey> = {
            let known = self.known.lock().await;
            known.keys().filter(|key| !listed.contains(key)).cloned().collect()
        };
        for key in vanished {
            summary += self.forget(&key).await;
        }

        debug!(
            target: "sluice::reconciler",
            triggers = triggers.len(),
            started = summary.started,
            removed = summary.removed,
            "resync complete"
        );
        Ok(summary)
    }

    /// Process watch events until `shutdown`, then stop every consumer.
    pub async fn run(self: Arc<Self>, mut subs: Subscriptions, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resync_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut triggers_open = true;
        let mut functions_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = subs.triggers.recv(), if triggers_open => match event {
                    Ok(event) => self.handle_trigger_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "sluice::reconciler", missed, "trigger watch lagged; resyncing");
                        self.resync_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(target: "sluice::reconciler", "trigger watch closed; relying on periodic resync");
                        triggers_open = false;
                    }
                },
                event = subs.functions.recv(), if functions_open => match event {
                    Ok(event) => {
                        let namespace = event.object().namespace.clone();
                        debug!(
                            target: "sluice::reconciler",
                            function = %event.object().target(),
                            "function changed"
                        );
                        self.functions_changed(&namespace).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "sluice::reconciler", missed, "function watch lagged; resyncing");
                        self.resync_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(target: "sluice::reconciler", "function watch closed; relying on periodic resync");
                        functions_open = false;
                    }
                },
                _ = ticker.tick() => self.resync_logged().await,
            }
        }

        self.shutdown().await;
    }

    /// Stop every consumer and forget all state.
    pub async fn shutdown(&self) -> usize {
        let mut known = self.known.lock().await;
        let stopped = self.consumers.shutdown().await;
        known.clear();
        self.phases.write().await.clear();
        info!(target: "sluice::reconciler", stopped, "reconciler stopped");
        stopped
    }

    async fn handle_trigger_event(&self, event: WatchEvent<Trigger>) {
        match event {
            WatchEvent::Added(trigger) | WatchEvent::Modified(trigger) => {
                if let Err(err) = self.apply(&trigger).await
                    && !matches!(err, crate::SluiceError::InvalidTrigger { .. })
                {
                    warn!(
                        target: "sluice::reconciler",
                        trigger = %trigger.key,
                        error = %err,
                        "reconcile failed; will retry on resync"
                    );
                }
            }
            WatchEvent::Deleted(trigger) => {
                self.forget(&trigger.key).await;
            }
        }
    }

    async fn resync_logged(&self) {
        if let Err(err) = self.resync().await {
            warn!(target: "sluice::reconciler", error = %err, "resync failed");
        }
    }

    async fn set_phase(&self, key: &TriggerKey, phase: TriggerPhase) {
        self.phases.write().await.insert(key.clone(), phase);
    }

    async fn reconcile(
        &self,
        key: &TriggerKey,
        spec: &TriggerSpec,
        force: bool,
    ) -> Result<ReconcileSummary> {
        let mut known = self.known.lock().await;

        // Forced passes still skip a spec already rejected as-is.
        if let Some(entry) = known.get(key)
            && entry.spec == *spec
            && (!force || !entry.valid)
        {
            debug!(target: "sluice::reconciler", trigger = %key, "spec unchanged");
            return Ok(ReconcileSummary::default());
        }

        if let Err(err) = spec.validate(key) {
            error!(
                target: "sluice::reconciler",
                trigger = %key,
                error = %err,
                "rejecting invalid trigger"
            );
            let mut summary = ReconcileSummary::default();
            if let Some(previous) = known.remove(key) {
                for identity in previous.consumers.keys() {
                    summary.record_remove(self.consumers.remove(identity).await);
                }
            }
            known.insert(
                key.clone(),
                KnownTrigger {
                    spec: spec.clone(),
                    valid: false,
                    consumers: BTreeMap::new(),
                },
            );
            self.set_phase(key, TriggerPhase::Removed).await;
            return Err(err);
        }

        let desired = self.resolve(key, spec).await?;
        let previous = known
            .remove(key)
            .map(|entry| entry.consumers)
            .unwrap_or_default();

        let mut summary = ReconcileSummary::default();
        for identity in previous.keys().filter(|id| !desired.contains_key(*id)) {
            summary.record_remove(self.consumers.remove(identity).await);
        }
        for (identity, params) in &desired {
            summary.record_ensure(
                self.consumers
                    .ensure(identity.clone(), params.clone())
                    .await,
            );
        }

        if desired.is_empty() {
            warn!(
                target: "sluice::reconciler",
                trigger = %key,
                "no function matches the trigger selector"
            );
        }
        if !summary.is_noop() {
            info!(
                target: "sluice::reconciler",
                trigger = %key,
                bucket = %spec.bucket,
                prefix = %spec.sub_dir,
                consumers = desired.len(),
                started = summary.started,
                retuned = summary.retuned,
                removed = summary.removed,
                "trigger reconciled"
            );
        }

        known.insert(
            key.clone(),
            KnownTrigger {
                spec: spec.clone(),
                valid: true,
                consumers: desired,
            },
        );
        self.set_phase(key, TriggerPhase::Active).await;
        Ok(summary)
    }

    async fn resolve(
        &self,
        key: &TriggerKey,
        spec: &TriggerSpec,
    ) -> Result<BTreeMap<ConsumerIdentity, ConsumerParams>> {
        let functions = self.functions.list_functions(&key.namespace).await?;
        Ok(functions
            .iter()
            .filter(|function| spec.function_selector.matches(&function.labels))
            .map(|function| {
                (
                    ConsumerIdentity::new(key, &function.name, spec),
                    ConsumerParams {
                        function: function.target(),
                        poll_interval: spec.poll_interval(),
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{CheckpointPublisher, RegistryCheckpointReader},
        config::ConsumerSettings,
        consumer::ConsumerDeps,
        dispatch::FunctionInvoker,
        registry::InMemoryTriggerRegistry,
        selector::LabelSelector,
        storage::{InMemoryObjectLister, Scanner},
        types::{DiscoveredObject, FunctionTarget},
        SluiceError,
    };
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::registry::WATCH_CHANNEL_CAPACITY;

    struct NoopInvoker;

    #[async_trait]
    impl FunctionInvoker for NoopInvoker {
        async fn invoke(&self, _: &FunctionTarget, _: &DiscoveredObject) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<InMemoryTriggerRegistry>,
        reconciler: Reconciler,
        _advances: mpsc::Receiver<crate::checkpoint::CheckpointAdvance>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryTriggerRegistry::new());
        registry
            .put_function(Function::new("default", "resize").with_label("fn", "img"))
            .await;
        registry
            .put_function(Function::new("default", "thumbnail").with_label("fn", "img"))
            .await;
        registry
            .put_function(Function::new("default", "transcode").with_label("fn", "video"))
            .await;

        let book = CheckpointBook::new();
        let (tx, rx) = mpsc::channel(64);
        let deps = ConsumerDeps {
            scanner: Scanner::new(Arc::new(InMemoryObjectLister::new())),
            invoker: Arc::new(NoopInvoker),
            checkpoints: Arc::new(RegistryCheckpointReader::new(registry.clone(), book.clone())),
            publisher: CheckpointPublisher::new(tx, book.clone()),
            settings: ConsumerSettings::default(),
        };
        let reconciler = Reconciler::new(
            registry.clone(),
            registry.clone(),
            Arc::new(ConsumerRegistry::new(deps)),
            book,
            ReconcilerConfig::default(),
        );
        Fixture {
            registry,
            reconciler,
            _advances: rx,
        }
    }

    fn trigger(selector: &str, prefix: &str, every: i64) -> Trigger {
        Trigger::new(
            TriggerKey::new("default", "media"),
            TriggerSpec::new("uploads", prefix, every, LabelSelector::from_labels([("fn", selector)])),
        )
    }

    #[tokio::test]
    async fn selector_fans_out_one_consumer_per_function() {
        let fx = fixture().await;
        let summary = fx.reconciler.apply(&trigger("img", "", 30)).await.unwrap();

        assert_eq!(summary.started, 2);
        let functions: Vec<_> = fx
            .reconciler
            .consumers()
            .active()
            .await
            .into_iter()
            .map(|id| id.function)
            .collect();
        assert_eq!(functions, vec!["resize", "thumbnail"]);
        assert_eq!(
            fx.reconciler.phase(&TriggerKey::new("default", "media")).await,
            TriggerPhase::Active
        );
        fx.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn unchanged_spec_is_a_noop_and_interval_change_retunes() {
        let fx = fixture().await;
        let base = trigger("video", "clips/", 30);
        fx.reconciler.apply(&base).await.unwrap();
        let before = fx.reconciler.consumers().active().await;

        assert!(fx.reconciler.apply(&base).await.unwrap().is_noop());

        let retuned = fx.reconciler.apply(&trigger("video", "clips/", 60)).await.unwrap();
        assert_eq!(retuned.retuned, 1);
        assert_eq!(retuned.started, 0);
        assert_eq!(fx.reconciler.consumers().active().await, before);
        fx.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn prefix_change_swaps_identity() {
        let fx = fixture().await;
        fx.reconciler.apply(&trigger("video", "clips/", 30)).await.unwrap();
        let summary = fx.reconciler.apply(&trigger("video", "raw/", 30)).await.unwrap();

        assert_eq!(summary.removed, 1);
        assert_eq!(summary.started, 1);
        let active = fx.reconciler.consumers().active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].prefix, "raw/");
        fx.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_update_removes_previous_consumers() {
        let fx = fixture().await;
        let key = TriggerKey::new("default", "media");
        fx.reconciler.apply(&trigger("img", "", 30)).await.unwrap();

        let err = fx.reconciler.apply(&trigger("img", "", 0)).await.unwrap_err();
        assert!(matches!(err, SluiceError::InvalidTrigger { .. }));
        assert!(fx.reconciler.consumers().is_empty().await);
        assert_eq!(fx.reconciler.phase(&key).await, TriggerPhase::Removed);

        // Fixing the spec brings it back.
        fx.reconciler.apply(&trigger("img", "", 30)).await.unwrap();
        assert_eq!(fx.reconciler.phase(&key).await, TriggerPhase::Active);
        fx.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn forget_drains_and_returns_to_absent() {
        let fx = fixture().await;
        let key = TriggerKey::new("default", "media");
        fx.reconciler.apply(&trigger("img", "", 30)).await.unwrap();

        let summary = fx.reconciler.forget(&key).await;
        assert_eq!(summary.removed, 2);
        assert!(fx.reconciler.consumers().is_empty().await);
        assert_eq!(fx.reconciler.phase(&key).await, TriggerPhase::Absent);
        assert!(fx.reconciler.forget(&key).await.is_noop());
    }

    #[tokio::test]
    async fn function_changes_re_resolve_triggers() {
        let fx = fixture().await;
        fx.reconciler.apply(&trigger("video", "", 30)).await.unwrap();
        assert_eq!(fx.reconciler.consumers().len().await, 1);

        fx.registry
            .put_function(Function::new("default", "proxy").with_label("fn", "video"))
            .await;
        let added = fx.reconciler.functions_changed("default").await;
        assert_eq!(added.started, 1);
        assert_eq!(fx.reconciler.consumers().len().await, 2);

        fx.registry.delete_function("default", "transcode").await;
        let removed = fx.reconciler.functions_changed("default").await;
        assert_eq!(removed.removed, 1);
        let active = fx.reconciler.consumers().active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].function, "proxy");

        // Other namespaces are untouched.
        assert!(fx.reconciler.functions_changed("other").await.is_noop());
        fx.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn resync_forgets_triggers_missing_from_the_registry() {
        let fx = fixture().await;
        let kept = fx.registry.create(trigger("img", "", 30)).await.unwrap();
        let ghost = Trigger::new(
            TriggerKey::new("default", "ghost"),
            TriggerSpec::new("other", "", 30, LabelSelector::from_labels([("fn", "video")])),
        );
        fx.reconciler.apply(&ghost).await.unwrap();
        assert_eq!(fx.reconciler.consumers().len().await, 1);

        let summary = fx.reconciler.resync().await.unwrap();
        assert_eq!(summary.started, 2);
        assert_eq!(summary.removed, 1);
        assert_eq!(fx.reconciler.phase(&ghost.key).await, TriggerPhase::Absent);
        assert_eq!(fx.reconciler.phase(&kept.key).await, TriggerPhase::Active);
        fx.reconciler.shutdown().await;
    }

    async fn wait_for_consumers(reconciler: &Reconciler, expected: usize) {
        let converged = tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.consumers().len().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            converged.is_ok(),
            "expected {expected} consumers, found {}",
            reconciler.consumers().len().await
        );
    }

    #[tokio::test]
    async fn lagged_watch_converges_through_resync() {
        let fx = fixture().await;
        let reconciler = Arc::new(fx.reconciler);
        let subs = reconciler.subscribe();

        // Overflow the watch before the loop reads anything, so the oldest
        // creations are only reachable through the resync.
        let total = WATCH_CHANNEL_CAPACITY + 44;
        for i in 0..total {
            fx.registry
                .create(Trigger::new(
                    TriggerKey::new("default", format!("t{i}")),
                    TriggerSpec::new(
                        "uploads",
                        "",
                        30,
                        LabelSelector::from_labels([("fn", "video")]),
                    ),
                ))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reconciler.clone().run(subs, shutdown.clone()));

        wait_for_consumers(&reconciler, total).await;
        assert_eq!(
            reconciler.phase(&TriggerKey::new("default", "t0")).await,
            TriggerPhase::Active
        );

        shutdown.cancel();
        task.await.unwrap();
        assert!(reconciler.consumers().is_empty().await);
    }

    #[tokio::test]
    async fn run_follows_function_and_trigger_events() {
        let fx = fixture().await;
        let reconciler = Arc::new(fx.reconciler);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reconciler.clone().run(reconciler.subscribe(), shutdown.clone()));

        let created = fx.registry.create(trigger("video", "", 30)).await.unwrap();
        wait_for_consumers(&reconciler, 1).await;

        fx.registry
            .put_function(Function::new("default", "proxy").with_label("fn", "video"))
            .await;
        wait_for_consumers(&reconciler, 2).await;

        fx.registry.delete_function("default", "transcode").await;
        wait_for_consumers(&reconciler, 1).await;
        let active = reconciler.consumers().active().await;
        assert_eq!(active[0].function, "proxy");

        // A function outside the selector changes nothing.
        fx.registry
            .put_function(Function::new("default", "archive").with_label("fn", "cold"))
            .await;
        fx.registry.delete(&created.key).await.unwrap();
        wait_for_consumers(&reconciler, 0).await;
        assert_eq!(reconciler.phase(&created.key).await, TriggerPhase::Absent);

        shutdown.cancel();
        task.await.unwrap();
    }
}
