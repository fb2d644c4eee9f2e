//! Wakeup scheduling - manual drains and an optional periodic timer.
//!
//! The scheduler only decides *when* to drain; the drain itself is the
//! coordinator's `sync`, which already ignores wakeups while offline or busy.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use medstock_common::{Error, Result};

use crate::engine::SyncReport;

/// When the background task wakes the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeupMode {
    /// Only on explicit requests.
    Manual,
    /// On explicit requests and at a fixed interval.
    Periodic { interval: Duration },
}

impl WakeupMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            Self::Manual => None,
            Self::Periodic { interval } => Some(*interval),
        }
    }
}

/// Requests accepted by the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Drain the outbox once.
    Drain,
    /// Stop the background task.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// Front end used to request drains from the background task.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its background task.
    pub fn new(mode: WakeupMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);

        let scheduler = Self { request_tx };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Ask for a drain and wait for its report.
    ///
    /// # Errors
    /// - `Sync` if the background task is not running
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Drain, response_tx))
            .await
            .map_err(|_| Error::Sync("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Sync("Failed to receive sync result".to_string()))?
    }

    /// Stop the background task.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// The scheduler's background task.
pub struct SyncSchedulerHandle {
    mode: WakeupMode,
    request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
}

impl SyncSchedulerHandle {
    /// Run until shutdown or until every [`SyncScheduler`] is dropped.
    ///
    /// Meant to be spawned; `sync_fn` performs one drain.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let mut timer = self.mode.interval().map(Self::timer);

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        debug!("All scheduler handles dropped");
                        break;
                    };
                    match request {
                        SyncRequest::Shutdown => {
                            info!("Received shutdown request");
                            break;
                        }
                        SyncRequest::Drain => {
                            let _ = response_tx.send(sync_fn().await);
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut timer) => {
                    debug!("Periodic wakeup");
                    match sync_fn().await {
                        Ok(report) if !report.is_empty() => info!(
                            "Periodic sync completed: {} succeeded, {} failed",
                            report.success, report.failed
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    fn timer(period: Duration) -> Interval {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.reset();
        timer
    }

    async fn wait_for_tick(timer: &mut Option<Interval>) {
        match timer {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
