use std::{fmt, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    checkpoint::{CheckpointBook, CheckpointPublisher, CheckpointWriter, RegistryCheckpointReader},
    config::{ConsumerSettings, ReconcilerConfig},
    consumer::{ConsumerDeps, ConsumerIdentity, ConsumerRegistry},
    dispatch::FunctionInvoker,
    error::Result,
    reconciler::{ReconcileSummary, Reconciler},
    registry::{FunctionDirectory, TriggerRegistry},
    storage::{ObjectLister, Scanner},
};

/// External collaborators an engine instance is built from.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub registry: Arc<dyn TriggerRegistry>,
    pub functions: Arc<dyn FunctionDirectory>,
    pub lister: Arc<dyn ObjectLister>,
    pub invoker: Arc<dyn FunctionInvoker>,
}

impl fmt::Debug for RuntimeDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeDeps").finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeSettings {
    pub consumer: ConsumerSettings,
    pub reconciler: ReconcilerConfig,
}

/// A running engine: reconcile loop, its consumers, and the checkpoint
/// writer.
pub struct SluiceRuntime {
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
    writer_stop: CancellationToken,
    reconcile_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    initial: ReconcileSummary,
}

impl fmt::Debug for SluiceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SluiceRuntime")
            .field("reconciler", &self.reconciler)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .field("initial", &self.initial)
            .finish()
    }
}

impl SluiceRuntime {
    /// Wire the engine, reconcile every declared trigger, and start watching.
    /// Failing to list triggers is fatal.
    pub async fn start(deps: RuntimeDeps, settings: RuntimeSettings) -> Result<Self> {
        let RuntimeDeps {
            registry,
            functions,
            lister,
            invoker,
        } = deps;

        let (tx, rx) = mpsc::channel(settings.consumer.checkpoint_channel_capacity.max(1));
        let book = CheckpointBook::new();
        let writer_stop = CancellationToken::new();
        let writer_task = tokio::spawn(
            CheckpointWriter::new(Arc::clone(&registry), rx).run_until(writer_stop.clone()),
        );

        let consumers = Arc::new(ConsumerRegistry::new(ConsumerDeps {
            scanner: Scanner::new(lister),
            invoker,
            checkpoints: Arc::new(RegistryCheckpointReader::new(
                Arc::clone(&registry),
                book.clone(),
            )),
            publisher: CheckpointPublisher::new(tx, book.clone()),
            settings: settings.consumer,
        }));
        let reconciler = Arc::new(Reconciler::new(
            registry,
            functions,
            consumers,
            book,
            settings.reconciler,
        ));

        let subscriptions = reconciler.subscribe();
        let initial = match reconciler.resync().await {
            Ok(summary) => summary,
            Err(err) => {
                error!(target: "sluice::reconciler", error = %err, "initial trigger listing failed");
                reconciler.shutdown().await;
                writer_stop.cancel();
                let _ = writer_task.await;
                return Err(err);
            }
        };
        info!(
            target: "sluice::reconciler",
            consumers = initial.started,
            "initial reconcile complete"
        );

        let shutdown = CancellationToken::new();
        let reconcile_task = tokio::spawn(Arc::clone(&reconciler).run(subscriptions, shutdown.clone()));

        Ok(Self {
            reconciler,
            shutdown,
            writer_stop,
            reconcile_task,
            writer_task,
            initial,
        })
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        self.reconciler.consumers()
    }

    /// Outcome of the startup resync.
    pub fn initial_summary(&self) -> ReconcileSummary {
        self.initial
    }

    pub async fn active_consumers(&self) -> Vec<ConsumerIdentity> {
        self.consumers().active().await
    }

    /// Stop the reconcile loop and every consumer, then flush pending
    /// checkpoints.
    pub async fn shutdown(self) {
        info!(target: "sluice::reconciler", "draining");
        self.shutdown.cancel();
        if let Err(err) = self.reconcile_task.await {
            error!(target: "sluice::reconciler", error = %err, "reconcile task failed");
            // The loop never reached its own drain.
            self.reconciler.shutdown().await;
        }

        self.writer_stop.cancel();
        if let Err(err) = self.writer_task.await {
            error!(target: "sluice::checkpoint", error = %err, "checkpoint writer failed");
        }
        info!(target: "sluice::reconciler", "drained");
    }
}
