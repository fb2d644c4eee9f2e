//! Sync coordinator that drains the outbox against the remote API.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use medstock_common::{now_millis, Result};
use medstock_storage::{
    DurableStore, LogStatus, PendingChange, StoreOpener, SyncLogEntry, LAST_SYNC_TIME_KEY,
};

use crate::connectivity::ConnectivityMonitor;
use crate::observers::Subscription;
use crate::queue::ChangeQueue;
use crate::remote::{RemoteApi, RemoteResponse, ReplayAuth, ReplayRequest, TransportError};
use crate::status::StatusPublisher;

/// Name of the store lease guarding drains across engine instances.
pub const DRAIN_LEASE: &str = "outbox-drain";

/// Outcome counts of one `sync()` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: usize,
    pub failed: usize,
}

impl SyncReport {
    /// Whether nothing was processed.
    pub fn is_empty(&self) -> bool {
        self.success == 0 && self.failed == 0
    }
}

/// Store-level lease settings for multi-instance deployments.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Unique id of this engine instance.
    pub holder: String,
    /// How long a lease stays valid without being released.
    pub ttl: Duration,
}

impl LeaseConfig {
    /// Lease with a fresh random holder id.
    pub fn new(ttl: Duration) -> Self {
        Self {
            holder: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

/// Classify the result of one replay attempt.
///
/// Returns the log status and the error detail to record.
pub fn classify(
    outcome: &std::result::Result<RemoteResponse, TransportError>,
) -> (LogStatus, Option<String>) {
    match outcome {
        Ok(response) if (200..300).contains(&response.status) => (LogStatus::Success, None),
        Ok(response) if (400..500).contains(&response.status) => {
            (LogStatus::ClientError, Some(response.body.clone()))
        }
        // 5xx, and anything else that came back (1xx, 3xx), is retried later
        Ok(response) => (
            LogStatus::ServerError,
            Some(format!("HTTP {}", response.status)),
        ),
        Err(e) => (LogStatus::NetworkError, Some(e.to_string())),
    }
}

/// Whether a classified change leaves the outbox.
fn removes_change(status: LogStatus) -> bool {
    matches!(status, LogStatus::Success | LogStatus::ClientError)
}

/// Releases the in-progress flag, and clears `is_syncing` once published, on
/// every exit path.
struct DrainGuard<'a> {
    in_progress: &'a AtomicBool,
    status: &'a StatusPublisher,
    published: bool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(in_progress: &'a AtomicBool, status: &'a StatusPublisher) -> Option<Self> {
        in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Self {
            in_progress,
            status,
            published: false,
        })
    }

    fn publish_syncing(&mut self) {
        self.published = true;
        self.status.set_syncing(true);
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::SeqCst);
        if self.published {
            self.status.set_syncing(false);
        }
    }
}

/// Drains the change queue against the remote API, one change at a time.
///
/// At most one drain runs per coordinator. Changes are replayed strictly in
/// queue order and one failing change never stops the rest of the drain.
pub struct SyncCoordinator {
    store: Arc<StoreOpener>,
    queue: Arc<ChangeQueue>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    status: Arc<StatusPublisher>,
    auth: ReplayAuth,
    lease: Option<LeaseConfig>,
    in_progress: AtomicBool,
}

impl SyncCoordinator {
    /// Create a coordinator.
    pub fn new(
        store: Arc<StoreOpener>,
        queue: Arc<ChangeQueue>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        status: Arc<StatusPublisher>,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            connectivity,
            status,
            auth: ReplayAuth::default(),
            lease: None,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Set the credential policy used at replay time.
    pub fn with_auth(mut self, auth: ReplayAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Also take a store lease before draining.
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Whether a drain is running in this process.
    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Replay every queued change once.
    ///
    /// Returns `{0, 0}` without touching the store when offline or when a
    /// drain is already running.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the queue snapshot cannot be read
    pub async fn sync(&self) -> Result<SyncReport> {
        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync");
            return Ok(SyncReport::default());
        }

        let Some(mut guard) = DrainGuard::acquire(&self.in_progress, &self.status) else {
            debug!("Sync already in progress, skipping");
            return Ok(SyncReport::default());
        };

        let store = self.store.get().await?;

        if let Some(lease) = &self.lease {
            if !store
                .try_acquire_lease(DRAIN_LEASE, &lease.holder, lease.ttl)
                .await?
            {
                info!("Another instance is draining the outbox, skipping");
                return Ok(SyncReport::default());
            }
        }
        guard.publish_syncing();

        let result = self.drain(store.as_ref()).await;

        if let Some(lease) = &self.lease {
            if let Err(e) = store.release_lease(DRAIN_LEASE, &lease.holder).await {
                warn!("Failed to release drain lease: {}", e);
            }
        }

        drop(guard);
        result
    }

    async fn drain(&self, store: &dyn DurableStore) -> Result<SyncReport> {
        let start = Instant::now();
        let snapshot = self.queue.list().await?;
        let mut report = SyncReport::default();

        info!("Starting sync of {} pending changes", snapshot.len());

        for change in &snapshot {
            match self.replay(store, change).await {
                LogStatus::Success => report.success += 1,
                _ => report.failed += 1,
            }
        }

        let finished_at = now_millis();
        match store
            .set_meta(LAST_SYNC_TIME_KEY, &finished_at.to_string())
            .await
        {
            Ok(()) => self.status.set_last_sync_time(finished_at),
            Err(e) => warn!("Failed to record last sync time: {}", e),
        }
        self.status.refresh_or_warn().await;

        info!(
            "Sync completed in {:?}: {} succeeded, {} failed",
            start.elapsed(),
            report.success,
            report.failed
        );
        Ok(report)
    }

    /// Replay one change, record the outcome and return its classification.
    async fn replay(&self, store: &dyn DurableStore, change: &PendingChange) -> LogStatus {
        let mut request = ReplayRequest::from(change);
        self.auth.apply(&mut request).await;

        let outcome = self.remote.send(&request).await;
        let (status, detail) = classify(&outcome);

        match status {
            LogStatus::Success => debug!("Change {} replayed", change.id),
            LogStatus::ClientError => warn!(
                "Change {} ({}) rejected permanently: {}",
                change.id,
                change.change_type,
                detail.as_deref().unwrap_or_default()
            ),
            LogStatus::ServerError | LogStatus::NetworkError => debug!(
                "Change {} kept for retry: {}",
                change.id,
                detail.as_deref().unwrap_or_default()
            ),
        }

        if removes_change(status) {
            match store.delete_pending(change.id).await {
                Ok(()) => {
                    if let Err(e) = self.status.change_removed(change.id).await {
                        warn!("Failed to publish removal of change {}: {}", change.id, e);
                    }
                }
                Err(e) => error!("Failed to remove change {}: {}", change.id, e),
            }
        }

        let entry = SyncLogEntry {
            change_type: change.change_type.clone(),
            url: change.url.clone(),
            status,
            error: detail,
            timestamp: now_millis(),
        };
        if let Err(e) = store.add_log(entry).await {
            warn!("Failed to append sync log for change {}: {}", change.id, e);
        }

        status
    }

    /// Drain automatically whenever connectivity comes back.
    ///
    /// Must be called inside a Tokio runtime; the drain runs on that runtime.
    /// The coordinator is held weakly, so the subscription does not keep it
    /// alive.
    pub fn sync_on_reconnect(self: &Arc<Self>) -> Subscription {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::try_current().ok();
        if runtime.is_none() {
            warn!("No Tokio runtime, reconnect-triggered sync disabled");
        }

        self.connectivity.subscribe(move |online| {
            if !online {
                return;
            }
            let (Some(runtime), Some(coordinator)) = (runtime.as_ref(), coordinator.upgrade())
            else {
                return;
            };
            runtime.spawn(async move {
                match coordinator.sync().await {
                    Ok(report) if !report.is_empty() => info!(
                        "Reconnect sync: {} succeeded, {} failed",
                        report.success, report.failed
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Reconnect sync failed: {}", e),
                }
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use medstock_common::HttpMethod;
    use medstock_storage::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    type Outcome = std::result::Result<RemoteResponse, TransportError>;

    /// Remote that answers from a script and records what it was sent.
    #[derive(Default)]
    struct ScriptedRemote {
        outcomes: Mutex<VecDeque<Outcome>>,
        sent: Mutex<Vec<ReplayRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedRemote {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        fn gated(outcomes: Vec<Outcome>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(outcomes)
            }
        }

        fn sent_urls(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|r| r.url.clone()).collect()
        }
    }

    #[async_trait]
    impl RemoteApi for ScriptedRemote {
        async fn send(&self, request: &ReplayRequest) -> Outcome {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.sent.lock().unwrap().push(request.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RemoteResponse::new(200, "")))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<ChangeQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        status: Arc<StatusPublisher>,
        coordinator: Arc<SyncCoordinator>,
        remote: Arc<ScriptedRemote>,
    }

    fn fixture(remote: ScriptedRemote, online: bool) -> Fixture {
        fixture_with(remote, online, |c| c)
    }

    fn fixture_with(
        remote: ScriptedRemote,
        online: bool,
        configure: impl FnOnce(SyncCoordinator) -> SyncCoordinator,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let opener = Arc::new(StoreOpener::from_store(store.clone() as Arc<dyn DurableStore>));
        let queue = Arc::new(ChangeQueue::new(Arc::clone(&opener)));
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let status = Arc::new(StatusPublisher::new(
            Arc::clone(&opener),
            Arc::clone(&queue),
            online,
        ));
        let remote = Arc::new(remote);
        let coordinator = Arc::new(configure(SyncCoordinator::new(
            opener,
            Arc::clone(&queue),
            remote.clone() as Arc<dyn RemoteApi>,
            Arc::clone(&connectivity),
            Arc::clone(&status),
        )));
        Fixture {
            store,
            queue,
            connectivity,
            status,
            coordinator,
            remote,
        }
    }

    async fn enqueue(queue: &ChangeQueue, url: &str) -> PendingChange {
        queue
            .enqueue(ReplayRequest::new(HttpMethod::Post, url).with_body("{}"))
            .await
            .unwrap()
    }

    fn transport_error() -> Outcome {
        Err(TransportError("connection reset".to_string()))
    }

    #[test]
    fn test_classify_table() {
        let ok = |status| Ok(RemoteResponse::new(status, "body"));
        assert_eq!(classify(&ok(200)).0, LogStatus::Success);
        assert_eq!(classify(&ok(201)).0, LogStatus::Success);
        assert_eq!(classify(&ok(299)).0, LogStatus::Success);
        assert_eq!(classify(&ok(400)), (LogStatus::ClientError, Some("body".to_string())));
        assert_eq!(classify(&ok(499)).0, LogStatus::ClientError);
        assert_eq!(classify(&ok(500)).0, LogStatus::ServerError);
        assert_eq!(classify(&ok(503)).0, LogStatus::ServerError);
        assert_eq!(classify(&ok(302)).0, LogStatus::ServerError);
        assert_eq!(classify(&ok(101)).0, LogStatus::ServerError);
        assert_eq!(classify(&transport_error()).0, LogStatus::NetworkError);
    }

    #[tokio::test]
    async fn test_mixed_outcomes_keep_only_transient_failures() {
        let f = fixture(
            ScriptedRemote::new(vec![
                Ok(RemoteResponse::new(201, "created")),
                Ok(RemoteResponse::new(404, "no such material")),
                transport_error(),
            ]),
            true,
        );
        enqueue(&f.queue, "/api/materials").await;
        enqueue(&f.queue, "/api/materials/99").await;
        let kept = enqueue(&f.queue, "/api/usages").await;

        let report = f.coordinator.sync().await.unwrap();

        assert_eq!(report, SyncReport { success: 1, failed: 2 });
        assert_eq!(f.queue.list().await.unwrap(), vec![kept]);

        let log = f.store.list_log().await.unwrap();
        let statuses: Vec<_> = log.iter().map(|l| l.entry.status).collect();
        assert_eq!(
            statuses,
            vec![LogStatus::Success, LogStatus::ClientError, LogStatus::NetworkError]
        );
        assert_eq!(log[1].entry.error.as_deref(), Some("no such material"));
    }

    #[tokio::test]
    async fn test_server_error_is_retained_and_retried_next_time() {
        let f = fixture(
            ScriptedRemote::new(vec![
                Ok(RemoteResponse::new(503, "busy")),
                Ok(RemoteResponse::new(200, "")),
            ]),
            true,
        );
        let change = enqueue(&f.queue, "/api/stock/4").await;

        let first = f.coordinator.sync().await.unwrap();
        assert_eq!(first, SyncReport { success: 0, failed: 1 });
        assert_eq!(f.queue.list().await.unwrap(), vec![change.clone()]);
        // Never mutated in place
        assert_eq!(f.queue.get(change.id).await.unwrap().unwrap().retry_count, 0);

        let second = f.coordinator.sync().await.unwrap();
        assert_eq!(second, SyncReport { success: 1, failed: 0 });
        assert_eq!(f.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replays_in_enqueue_order_with_captured_request() {
        let f = fixture(ScriptedRemote::default(), true);
        let mut urls = Vec::new();
        for n in 0..5 {
            let url = format!("/api/stock/{n}");
            f.queue
                .enqueue(
                    ReplayRequest::new(HttpMethod::Put, url.clone())
                        .with_header("Authorization", "Bearer captured")
                        .with_body(format!(r#"{{"qty":{n}}}"#)),
                )
                .await
                .unwrap();
            urls.push(url);
        }

        f.coordinator.sync().await.unwrap();

        assert_eq!(f.remote.sent_urls(), urls);
        let sent = f.remote.sent.lock().unwrap();
        assert_eq!(sent[2].method, HttpMethod::Put);
        assert_eq!(sent[2].body.as_deref(), Some(r#"{"qty":2}"#));
        assert_eq!(sent[2].headers.get("Authorization").unwrap(), "Bearer captured");
    }

    #[tokio::test]
    async fn test_offline_fast_path_never_touches_store() {
        let f = fixture(ScriptedRemote::default(), false);
        enqueue(&f.queue, "/api/materials").await;
        let before = f.store.pending_accesses();

        let report = f.coordinator.sync().await.unwrap();

        assert!(report.is_empty());
        assert_eq!(f.store.pending_accesses(), before);
        assert!(f.remote.sent_urls().is_empty());
        assert!(!f.status.status().is_syncing);
    }

    #[tokio::test]
    async fn test_second_concurrent_sync_is_noop() {
        let gate = Arc::new(Notify::new());
        let f = fixture(ScriptedRemote::gated(vec![], Arc::clone(&gate)), true);
        enqueue(&f.queue, "/api/materials").await;

        let running = {
            let coordinator = Arc::clone(&f.coordinator);
            tokio::spawn(async move { coordinator.sync().await })
        };
        while !f.coordinator.is_syncing() {
            tokio::task::yield_now().await;
        }

        let second = f.coordinator.sync().await.unwrap();
        assert!(second.is_empty());

        gate.notify_one();
        let first = running.await.unwrap().unwrap();
        assert_eq!(first, SyncReport { success: 1, failed: 0 });
        assert!(!f.coordinator.is_syncing());
    }

    #[tokio::test]
    async fn test_changes_enqueued_during_drain_wait_for_next_sync() {
        let gate = Arc::new(Notify::new());
        let f = fixture(ScriptedRemote::gated(vec![], Arc::clone(&gate)), true);
        enqueue(&f.queue, "/api/materials").await;

        let running = {
            let coordinator = Arc::clone(&f.coordinator);
            tokio::spawn(async move { coordinator.sync().await })
        };
        while !f.coordinator.is_syncing() {
            tokio::task::yield_now().await;
        }
        let late = enqueue(&f.queue, "/api/barcodes").await;
        f.status.refresh().await.unwrap();
        gate.notify_one();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.success, 1);
        assert_eq!(f.queue.list().await.unwrap(), vec![late]);
        assert_eq!(
            f.status.status().pending_count,
            f.queue.count().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_snapshot_failure_releases_flag() {
        let f = fixture(ScriptedRemote::default(), true);
        f.store.set_unavailable(true);

        assert!(f.coordinator.sync().await.is_err());
        assert!(!f.coordinator.is_syncing());
        assert!(!f.status.status().is_syncing);

        f.store.set_unavailable(false);
        enqueue(&f.queue, "/api/materials").await;
        assert_eq!(f.coordinator.sync().await.unwrap().success, 1);
    }

    #[tokio::test]
    async fn test_sync_records_last_sync_time_and_publishes() {
        let f = fixture(ScriptedRemote::default(), true);
        enqueue(&f.queue, "/api/materials").await;
        enqueue(&f.queue, "/api/materials").await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = f.status.subscribe(move |event| {
            sink.lock()
                .unwrap()
                .push((event.status.is_syncing, event.status.pending_count));
        });

        f.coordinator.sync().await.unwrap();

        let status = f.status.status();
        assert!(status.last_sync_time.is_some());
        assert_eq!(status.pending_count, 0);
        assert!(!status.is_syncing);
        assert!(f.store.get_meta(LAST_SYNC_TIME_KEY).await.unwrap().is_some());

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&(true, 0)));
        assert_eq!(events.last(), Some(&(false, 0)));
        // One publication per removal
        assert!(events.contains(&(true, 1)));
    }

    #[tokio::test]
    async fn test_reconnect_triggers_sync() {
        let f = fixture(ScriptedRemote::default(), false);
        enqueue(&f.queue, "/api/materials").await;
        enqueue(&f.queue, "/api/usages").await;
        let _auto = f.coordinator.sync_on_reconnect();

        let drained = Arc::new(Notify::new());
        let signal = Arc::clone(&drained);
        let _sub = f.status.subscribe(move |event| {
            if event.status.pending_count == 0 && !event.status.is_syncing {
                signal.notify_one();
            }
        });

        f.connectivity.report(true);
        tokio::time::timeout(Duration::from_secs(5), drained.notified())
            .await
            .unwrap();

        assert_eq!(f.queue.count().await.unwrap(), 0);
        assert_eq!(f.remote.sent_urls().len(), 2);
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_skips_drain() {
        let f = fixture_with(ScriptedRemote::default(), true, |c| {
            c.with_lease(LeaseConfig::new(Duration::from_secs(60)))
        });
        enqueue(&f.queue, "/api/materials").await;
        assert!(f
            .store
            .try_acquire_lease(DRAIN_LEASE, "other-instance", Duration::from_secs(60))
            .await
            .unwrap());

        let report = f.coordinator.sync().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(f.queue.count().await.unwrap(), 1);

        f.store.release_lease(DRAIN_LEASE, "other-instance").await.unwrap();
        assert_eq!(f.coordinator.sync().await.unwrap().success, 1);
        // Our own lease was released after draining
        assert!(f
            .store
            .try_acquire_lease(DRAIN_LEASE, "other-instance", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
