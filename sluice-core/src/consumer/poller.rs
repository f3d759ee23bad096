use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConsumerIdentity, registry::ConsumerDeps};
use crate::{
    checkpoint::{self, CheckpointAdvance, CheckpointPublisher, CheckpointReader},
    config::ConsumerSettings,
    dispatch::{DispatchPool, Dispatcher},
    storage::{ScanOutcome, Scanner},
};

/// Scan, dispatch, advance, sleep; until stopped.
///
/// The checkpoint for the next cycle is captured right after the scan
/// returns and before any object is handed to dispatch. Objects written while
/// the scan was running are picked up next cycle; delivery is at-least-once.
/// A failed listing leaves the checkpoint where it was so the missed window
/// is scanned again. Objects already queued for dispatch when stop fires are
/// still invoked before the stop is acknowledged.
pub struct Poller {
    identity: ConsumerIdentity,
    scanner: Scanner,
    checkpoints: Arc<dyn CheckpointReader>,
    publisher: CheckpointPublisher,
    dispatcher: Dispatcher,
    settings: ConsumerSettings,
    interval: watch::Receiver<Duration>,
    stop: CancellationToken,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("identity", &self.identity)
            .field("interval", &*self.interval.borrow())
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub fn new(
        identity: ConsumerIdentity,
        deps: &ConsumerDeps,
        dispatcher: Dispatcher,
        interval: watch::Receiver<Duration>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            identity,
            scanner: deps.scanner.clone(),
            checkpoints: Arc::clone(&deps.checkpoints),
            publisher: deps.publisher.clone(),
            dispatcher,
            settings: deps.settings.clone(),
            interval,
            stop,
        }
    }

    /// Drive the loop until `stop` fires. `stopped` is completed on exit,
    /// after every dispatch worker of this poller has finished.
    pub async fn run(mut self, stopped: oneshot::Sender<()>) {
        let trigger = self.identity.trigger_key();
        let mut since = self.initial_checkpoint().await;

        info!(
            target: "sluice::poller",
            consumer = %self.identity,
            trigger = %trigger,
            function = %self.dispatcher.target(),
            since = %checkpoint::format(since),
            "poller started"
        );

        let pool = DispatchPool::spawn(self.dispatcher.clone(), &self.settings);

        while !self.stop.is_cancelled() {
            let ScanOutcome { objects, error } = self
                .scanner
                .scan(&self.identity.bucket, &self.identity.prefix, since)
                .await;
            let next = checkpoint::now();

            if let Some(err) = error {
                if err.is_transient() {
                    warn!(
                        target: "sluice::poller",
                        consumer = %self.identity,
                        bucket = %self.identity.bucket,
                        prefix = %self.identity.prefix,
                        error = %err,
                        "scan failed; checkpoint held"
                    );
                } else {
                    error!(
                        target: "sluice::poller",
                        consumer = %self.identity,
                        bucket = %self.identity.bucket,
                        prefix = %self.identity.prefix,
                        error = %err,
                        "scan failed; checkpoint held"
                    );
                }
            } else {
                let found = objects.len();
                let mut interrupted = false;
                for object in objects {
                    if !pool.submit(object, &self.stop).await {
                        interrupted = true;
                        break;
                    }
                }
                if interrupted {
                    debug!(
                        target: "sluice::poller",
                        consumer = %self.identity,
                        "stopped mid-batch; checkpoint not advanced, queued objects still delivered"
                    );
                    break;
                }

                let at = next.max(since);
                self.publisher
                    .publish(
                        CheckpointAdvance {
                            trigger: trigger.clone(),
                            consumer: self.identity.clone(),
                            at,
                        },
                        &self.stop,
                    )
                    .await;
                since = at;

                debug!(
                    target: "sluice::poller",
                    consumer = %self.identity,
                    discovered = found,
                    since = %checkpoint::format(since),
                    "poll cycle complete"
                );
            }

            if !self.sleep().await {
                break;
            }
        }

        let dropped = pool.shutdown().await;
        if dropped > 0 {
            warn!(
                target: "sluice::poller",
                consumer = %self.identity,
                dropped,
                "objects dropped by failed dispatch workers"
            );
        }
        info!(target: "sluice::poller", consumer = %self.identity, "poller stopped");
        let _ = stopped.send(());
    }

    async fn initial_checkpoint(&self) -> DateTime<Utc> {
        let started = checkpoint::now();
        match self.checkpoints.read(&self.identity.trigger_key()).await {
            Ok(Some(at)) => at,
            Ok(None) => started,
            Err(err) => {
                warn!(
                    target: "sluice::poller",
                    consumer = %self.identity,
                    error = %err,
                    "checkpoint unreadable; polling from now"
                );
                started
            }
        }
    }

    /// Wait one poll interval. Interval changes apply to the sleep already in
    /// progress. Returns false when stopped.
    async fn sleep(&mut self) -> bool {
        let started = Instant::now();
        loop {
            let deadline = deadline_after(started, *self.interval.borrow_and_update());
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = self.interval.changed() => {
                    if changed.is_err() {
                        // Interval sender is gone; finish this sleep as is.
                        tokio::select! {
                            biased;
                            _ = self.stop.cancelled() => return false,
                            _ = tokio::time::sleep_until(deadline) => return true,
                        }
                    }
                    let interval = *self.interval.borrow();
                    debug!(
                        target: "sluice::poller",
                        consumer = %self.identity,
                        interval = ?interval,
                        "poll interval changed"
                    );
                }
            }
        }
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + interval`, saturating at roughly thirty years out.
fn deadline_after(start: Instant, interval: Duration) -> Instant {
    start
        .checked_add(interval)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}
