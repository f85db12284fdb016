//! Polling driver: pass cadence, cutoff bookkeeping and failure isolation.

use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use mirrorsync_common::{Error, Result};

use crate::backoff::BackoffConfig;
use crate::cutoff::CutoffTracker;
use crate::reconcile::{Reconciler, SyncReport};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Time between scheduled passes.
    pub poll_interval: Duration,
    /// Delay policy after consecutive failed passes.
    pub backoff: BackoffConfig,
    /// How far back the first pass looks.
    pub initial_lookback: TimeDelta,
    /// Extra overlap subtracted from every cutoff.
    pub skew_allowance: TimeDelta,
    /// Stop the loop after this many failed passes in a row.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
            initial_lookback: TimeDelta::seconds(60),
            skew_allowance: TimeDelta::zero(),
            max_consecutive_failures: None,
        }
    }
}

type PassReply = oneshot::Sender<Result<SyncReport>>;

/// Requests the control side can send to a running loop.
#[derive(Debug)]
enum DriverRequest {
    /// Run a pass now and reply with its outcome.
    Pass(PassReply),
}

/// Control side of the driver.
///
/// Dropping it stops the loop the same way [`Driver::shutdown`] does.
pub struct Driver {
    request_tx: mpsc::Sender<DriverRequest>,
    shutdown_tx: watch::Sender<bool>,
}

impl Driver {
    /// Create a driver and the task that runs its loop.
    pub fn new(config: DriverConfig) -> (Self, DriverTask) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = CutoffTracker::new(config.initial_lookback, config.skew_allowance);

        let driver = Self {
            request_tx,
            shutdown_tx,
        };
        let task = DriverTask {
            config,
            request_rx,
            shutdown_rx,
            tracker,
        };

        (driver, task)
    }

    /// Run a pass immediately and wait for its outcome.
    pub async fn request_pass(&self) -> Result<SyncReport> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.request_tx
            .send(DriverRequest::Pass(reply_tx))
            .await
            .map_err(|_| Error::Cancelled)?;

        reply_rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Stop the loop, aborting a pass that is in flight.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// The polling loop. Spawn [`DriverTask::run`] on a tokio runtime.
pub struct DriverTask {
    config: DriverConfig,
    request_rx: mpsc::Receiver<DriverRequest>,
    shutdown_rx: watch::Receiver<bool>,
    tracker: CutoffTracker,
}

impl DriverTask {
    /// Run the loop until shutdown.
    ///
    /// `pass_fn` is called with the cutoff of each pass, on every tick of the
    /// poll interval and on every [`Driver::request_pass`]. Passes never
    /// overlap. A failed pass is logged and followed by a backoff delay; the
    /// loop only gives up on configuration errors or when
    /// `max_consecutive_failures` is reached.
    ///
    /// # Errors
    /// - `Config` when the loop halts because of a pass error
    pub async fn run<F, Fut>(self, mut pass_fn: F) -> Result<()>
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: Future<Output = Result<SyncReport>>,
    {
        let DriverTask {
            config,
            mut request_rx,
            mut shutdown_rx,
            mut tracker,
        } = self;

        let mut ticker = interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        info!("Sync driver started (poll interval {:?})", config.poll_interval);

        loop {
            let reply = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Sync driver shutting down");
                    break;
                }

                Some(request) = request_rx.recv() => match request {
                    DriverRequest::Pass(reply) => {
                        debug!("Processing requested sync pass");
                        Some(reply)
                    }
                },

                _ = ticker.tick() => None,
            };

            let started_at = Utc::now();
            let cutoff = tracker.next_cutoff(started_at);

            let outcome = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Sync driver shutting down, in-flight pass aborted");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::Cancelled));
                    }
                    break;
                }

                result = pass_fn(cutoff) => result,
            };

            let halt = match &outcome {
                Ok(_) => {
                    consecutive_failures = 0;
                    tracker.pass_succeeded(started_at);
                    None
                }
                Err(e) if e.is_fatal() => {
                    error!("Sync pass failed with a configuration error: {}", e);
                    Some(e.to_string())
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    match config.max_consecutive_failures {
                        Some(max) if consecutive_failures >= max => {
                            error!("Sync pass failed {} times in a row: {}", consecutive_failures, e);
                            Some(format!(
                                "{} consecutive failed passes, last: {}",
                                consecutive_failures, e
                            ))
                        }
                        _ => {
                            warn!(
                                "Sync pass failed ({} in a row, transient: {}): {}",
                                consecutive_failures,
                                e.is_transient(),
                                e
                            );
                            None
                        }
                    }
                }
            };

            let failed = outcome.is_err();
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }

            if let Some(reason) = halt {
                return Err(Error::Config(format!("Sync driver halted: {}", reason)));
            }

            if failed {
                let delay = config.backoff.delay_for_attempt(consecutive_failures - 1);
                debug!("Backing off for {:?}", delay);
                tokio::select! {
                    biased;

                    _ = wait_for_shutdown(&mut shutdown_rx) => {
                        info!("Sync driver shutting down during backoff");
                        break;
                    }

                    _ = sleep(delay) => {}
                }
            }
        }

        info!("Sync driver stopped");
        Ok(())
    }

    /// Run the loop against a reconciler.
    pub async fn run_reconciler(self, reconciler: Arc<Reconciler>) -> Result<()> {
        self.run(move |cutoff| {
            let reconciler = reconciler.clone();
            async move { reconciler.run(cutoff).await }
        })
        .await
    }
}

/// Resolves once shutdown is requested or the control side is dropped.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
