use std::{fmt, sync::Arc};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::Dispatcher;
use crate::{config::ConsumerSettings, types::DiscoveredObject};

/// Bounded queue drained by a fixed set of workers, one pool per consumer.
///
/// Everything accepted by [`submit`](DispatchPool::submit) is invoked before
/// [`shutdown`](DispatchPool::shutdown) returns: the poller has already
/// published a checkpoint past these objects, so a queued object is never
/// discarded on stop. Only objects stranded by panicked workers are dropped,
/// and each one is logged.
pub struct DispatchPool {
    tx: mpsc::Sender<DiscoveredObject>,
    rx: Arc<Mutex<mpsc::Receiver<DiscoveredObject>>>,
    workers: JoinSet<()>,
    worker_count: usize,
    dispatcher: Dispatcher,
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("workers", &self.worker_count)
            .field("queue_capacity", &self.tx.max_capacity())
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

impl DispatchPool {
    pub fn spawn(dispatcher: Dispatcher, settings: &ConsumerSettings) -> Self {
        let worker_count = settings.dispatch_workers.max(1);
        let (tx, rx) = mpsc::channel(settings.dispatch_queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            let rx = Arc::clone(&rx);
            let dispatcher = dispatcher.clone();
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(object) = next else {
                        break;
                    };
                    dispatcher.dispatch(&object).await;
                }
                debug!(
                    target: "sluice::dispatch",
                    function = %dispatcher.target(),
                    worker,
                    "dispatch worker exited"
                );
            });
        }

        Self {
            tx,
            rx,
            workers,
            worker_count,
            dispatcher,
        }
    }

    /// Queue an object, waiting only while the queue is full. Returns false
    /// if `stop` fired first; the object was then not queued.
    pub async fn submit(
        &self,
        object: DiscoveredObject,
        stop: &CancellationToken,
    ) -> bool {
        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            sent = self.tx.send(object) => sent.is_ok(),
        }
    }

    /// Close the queue, let the workers invoke everything still queued, and
    /// wait for them. Returns how many queued objects were dropped because
    /// no worker was left to take them.
    pub async fn shutdown(self) -> usize {
        let Self {
            tx,
            rx,
            mut workers,
            dispatcher,
            ..
        } = self;
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined
                && err.is_panic()
            {
                error!(target: "sluice::dispatch", error = %err, "dispatch worker panicked");
            }
        }

        let mut dropped = 0;
        let mut rx = rx.lock().await;
        while let Ok(object) = rx.try_recv() {
            dropped += 1;
            error!(
                target: "sluice::dispatch",
                function = %dispatcher.target(),
                consumer = %dispatcher.consumer(),
                bucket = %object.bucket,
                key = %object.key,
                modified = %object.modified,
                "dropping undelivered object"
            );
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::ConsumerIdentity,
        dispatch::FunctionInvoker,
        error::Result,
        selector::LabelSelector,
        types::{FunctionTarget, TriggerKey, TriggerSpec},
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Counts invocations and tracks peak concurrency.
    #[derive(Default)]
    struct GatedInvoker {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl FunctionInvoker for GatedInvoker {
        async fn invoke(&self, _: &FunctionTarget, _: &DiscoveredObject) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher(invoker: Arc<GatedInvoker>) -> Dispatcher {
        let key = TriggerKey::new("default", "photos");
        let spec = TriggerSpec::new("uploads", "", 30, LabelSelector::from_labels([("fn", "a")]));
        Dispatcher::new(
            invoker,
            FunctionTarget {
                namespace: "default".into(),
                name: "resize".into(),
                port: None,
            },
            ConsumerIdentity::new(&key, "resize", &spec),
        )
    }

    fn object(key: usize) -> DiscoveredObject {
        DiscoveredObject {
            bucket: "uploads".into(),
            key: format!("obj-{key}"),
            modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn drains_queue_with_bounded_concurrency() {
        let invoker = Arc::new(GatedInvoker::default());
        let settings = ConsumerSettings {
            dispatch_workers: 3,
            dispatch_queue_capacity: 4,
            ..ConsumerSettings::default()
        };
        let stop = CancellationToken::new();
        let pool = DispatchPool::spawn(dispatcher(invoker.clone()), &settings);

        for i in 0..20 {
            assert!(pool.submit(object(i), &stop).await);
        }
        assert_eq!(pool.shutdown().await, 0);

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 20);
        assert!(invoker.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn stop_still_delivers_everything_queued() {
        let invoker = Arc::new(GatedInvoker::default());
        let settings = ConsumerSettings {
            dispatch_workers: 1,
            dispatch_queue_capacity: 8,
            ..ConsumerSettings::default()
        };
        let stop = CancellationToken::new();
        let pool = DispatchPool::spawn(dispatcher(invoker.clone()), &settings);

        for i in 0..5 {
            assert!(pool.submit(object(i), &stop).await);
        }
        stop.cancel();
        assert!(!pool.submit(object(99), &stop).await);

        assert_eq!(pool.shutdown().await, 0);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 5);
        assert_eq!(invoker.in_flight.load(Ordering::SeqCst), 0);
    }

    struct PanickingInvoker;

    #[async_trait]
    impl FunctionInvoker for PanickingInvoker {
        async fn invoke(&self, _: &FunctionTarget, _: &DiscoveredObject) -> Result<()> {
            panic!("invoker blew up");
        }
    }

    #[tokio::test]
    async fn objects_stranded_by_a_panicked_worker_are_counted() {
        let key = TriggerKey::new("default", "photos");
        let spec = TriggerSpec::new("uploads", "", 30, LabelSelector::from_labels([("fn", "a")]));
        let dispatcher = Dispatcher::new(
            Arc::new(PanickingInvoker),
            FunctionTarget {
                namespace: "default".into(),
                name: "resize".into(),
                port: None,
            },
            ConsumerIdentity::new(&key, "resize", &spec),
        );
        let settings = ConsumerSettings {
            dispatch_workers: 1,
            dispatch_queue_capacity: 8,
            ..ConsumerSettings::default()
        };
        let stop = CancellationToken::new();
        let pool = DispatchPool::spawn(dispatcher, &settings);

        for i in 0..3 {
            assert!(pool.submit(object(i), &stop).await);
        }

        assert_eq!(pool.shutdown().await, 2);
    }
}
