//! Offline engine facade - the composition root for the UI layer.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use medstock_common::{ChangeId, Error, Result};
use medstock_storage::{DurableStore, LoggedSync, PendingChange, StoreOpener};
use medstock_sync::{
    ChangeQueue, Connectivity, ConnectivityMonitor, CredentialSource, HttpRemote, ReadCache,
    RemoteApi, ReplayAuth, ReplayRequest, StatusEvent, StatusPublisher, Subscription,
    SyncCoordinator, SyncReport, SyncScheduler, SyncStatus, WakeupMode,
};

use crate::config::{EngineConfig, ReplayAuthMode};

/// Subscriptions and tasks owned between `init` and `dispose`.
struct Wiring {
    subscriptions: Vec<Subscription>,
    scheduler: Option<(SyncScheduler, JoinHandle<()>)>,
}

/// Offline durability and sync engine.
///
/// Built explicitly by the host and shared by reference. Mutations captured
/// while offline are queued durably and replayed in order once the host
/// reports connectivity.
pub struct OfflineEngine {
    config: EngineConfig,
    store: Arc<StoreOpener>,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<ChangeQueue>,
    cache: ReadCache,
    status: Arc<StatusPublisher>,
    coordinator: Arc<SyncCoordinator>,
    wiring: Mutex<Option<Wiring>>,
}

impl OfflineEngine {
    /// Create an engine replaying through `remote`.
    ///
    /// # Errors
    /// - `Config` if the configuration is invalid, or asks for refreshed
    ///   credentials without a source (see [`OfflineEngine::with_credentials`])
    pub fn new(config: EngineConfig, remote: Arc<dyn RemoteApi>, initial_online: bool) -> Result<Self> {
        Self::assemble(config, None, remote, None, initial_online)
    }

    /// Create an engine replaying over HTTP as configured.
    pub fn with_http(config: EngineConfig, initial_online: bool) -> Result<Self> {
        let remote = HttpRemote::new(
            config.api_base_url.as_deref(),
            &config.user_agent,
            config.request_timeout(),
        )?;
        Self::new(config, Arc::new(remote), initial_online)
    }

    /// Create an engine that can refresh credentials at replay time.
    pub fn with_credentials(
        config: EngineConfig,
        remote: Arc<dyn RemoteApi>,
        credentials: Arc<dyn CredentialSource>,
        initial_online: bool,
    ) -> Result<Self> {
        Self::assemble(config, None, remote, Some(credentials), initial_online)
    }

    /// Create an engine on an already open store.
    pub fn with_store(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteApi>,
        initial_online: bool,
    ) -> Result<Self> {
        Self::assemble(config, Some(store), remote, None, initial_online)
    }

    fn assemble(
        config: EngineConfig,
        store: Option<Arc<dyn DurableStore>>,
        remote: Arc<dyn RemoteApi>,
        credentials: Option<Arc<dyn CredentialSource>>,
        initial_online: bool,
    ) -> Result<Self> {
        config.validate()?;

        let auth = match (config.replay_auth, credentials) {
            (ReplayAuthMode::Captured, _) => ReplayAuth::Captured,
            (ReplayAuthMode::Refresh, Some(source)) => ReplayAuth::Refresh(source),
            (ReplayAuthMode::Refresh, None) => {
                return Err(Error::Config(
                    "replay_auth \"refresh\" needs a credential source".to_string(),
                ))
            }
        };

        let store = Arc::new(match store {
            Some(store) => StoreOpener::from_store(store),
            None => StoreOpener::new(config.store_location()),
        });
        let connectivity = Arc::new(ConnectivityMonitor::new(initial_online));
        let queue = Arc::new(ChangeQueue::new(Arc::clone(&store)));
        let cache = ReadCache::new(Arc::clone(&store));
        let status = Arc::new(StatusPublisher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            initial_online,
        ));

        let mut coordinator = SyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            remote,
            Arc::clone(&connectivity),
            Arc::clone(&status),
        )
        .with_auth(auth);
        if let Some(lease) = config.lease() {
            coordinator = coordinator.with_lease(lease);
        }

        Ok(Self {
            config,
            store,
            connectivity,
            queue,
            cache,
            status,
            coordinator: Arc::new(coordinator),
            wiring: Mutex::new(None),
        })
    }

    /// Open the store, wire internal listeners and publish the first status.
    ///
    /// Calling it again while initialized does nothing. Must run inside a
    /// Tokio runtime.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the store cannot be opened; nothing stays wired
    pub async fn init(&self) -> Result<()> {
        let mut wiring = self.wiring.lock().await;
        if wiring.is_some() {
            debug!("Engine already initialized");
            return Ok(());
        }

        self.store.get().await?;

        let mut subscriptions = Vec::new();
        let status = Arc::clone(&self.status);
        subscriptions.push(self.connectivity.subscribe(move |online| status.set_online(online)));
        // Pick up transitions reported before init
        self.status.set_online(self.connectivity.is_online());

        if self.config.auto_sync_on_reconnect {
            subscriptions.push(self.coordinator.sync_on_reconnect());
        }

        let scheduler = match self.config.wakeup_mode() {
            WakeupMode::Manual => None,
            mode => {
                let (scheduler, handle) = SyncScheduler::new(mode);
                let coordinator = Arc::clone(&self.coordinator);
                let task = tokio::spawn(handle.run(move || {
                    let coordinator = Arc::clone(&coordinator);
                    async move { coordinator.sync().await }
                }));
                Some((scheduler, task))
            }
        };

        let initial = self.status.refresh().await;
        *wiring = Some(Wiring {
            subscriptions,
            scheduler,
        });
        drop(wiring);

        let initial = match initial {
            Ok(status) => status,
            Err(e) => {
                self.dispose().await;
                return Err(e);
            }
        };

        info!(
            "Offline engine ready ({} pending, {:?})",
            initial.pending_count,
            self.connectivity.state()
        );

        // Drain anything left over from a previous session
        if self.config.auto_sync_on_reconnect && self.connectivity.is_online() && initial.pending_count > 0 {
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                if let Err(e) = coordinator.sync().await {
                    warn!("Startup sync failed: {}", e);
                }
            });
        }

        Ok(())
    }

    /// Detach internal listeners and stop the scheduler.
    ///
    /// Calling it again, or before `init`, does nothing. A drain already
    /// running is left to finish.
    pub async fn dispose(&self) {
        let Some(wiring) = self.wiring.lock().await.take() else {
            return;
        };

        drop(wiring.subscriptions);
        if let Some((scheduler, task)) = wiring.scheduler {
            scheduler.shutdown().await;
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Offline engine disposed");
    }

    /// Whether `init` has completed and `dispose` has not been called since.
    pub async fn is_initialized(&self) -> bool {
        self.wiring.lock().await.is_some()
    }

    /// Queue a mutation for replay.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the change could not be persisted
    pub async fn enqueue(&self, request: ReplayRequest) -> Result<ChangeId> {
        let change = self.queue.enqueue(request).await?;
        self.status.refresh_or_warn().await;
        Ok(change.id)
    }

    /// Pending changes, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<PendingChange>> {
        self.queue.list().await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.queue.count().await
    }

    /// Drain the queue now.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.coordinator.sync().await
    }

    /// Ask for a drain the way a host wakeup would.
    ///
    /// Goes through the wakeup scheduler when one is running, so requests
    /// queue behind periodic wakeups; otherwise drains directly.
    ///
    /// # Errors
    /// - `Sync` if the scheduler stopped before answering
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let scheduler = self
            .wiring
            .lock()
            .await
            .as_ref()
            .and_then(|wiring| wiring.scheduler.as_ref())
            .map(|(scheduler, _)| scheduler.clone());

        match scheduler {
            Some(scheduler) => scheduler.request_sync().await,
            None => self.coordinator.sync().await,
        }
    }

    /// Listen for connectivity transitions.
    pub fn subscribe_connectivity(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.connectivity.subscribe(callback)
    }

    /// Listen for status publications.
    pub fn subscribe_status(
        &self,
        callback: impl Fn(&StatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.status.subscribe(callback)
    }

    /// Cache a server read.
    pub async fn cache_put(&self, key: &str, data: Value) -> Result<()> {
        self.cache.put(key, data).await
    }

    /// Read a cached value.
    pub async fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        self.cache.get(key).await
    }

    /// Typed access to the read cache.
    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Feed the host connectivity signal.
    pub fn set_online(&self, online: bool) {
        self.connectivity.report(online);
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.state()
    }

    /// Latest published status.
    pub fn status(&self) -> SyncStatus {
        self.status.status()
    }

    /// Recompute and publish the status.
    pub async fn refresh_status(&self) -> Result<SyncStatus> {
        self.status.refresh().await
    }

    /// Every recorded replay attempt, oldest first.
    pub async fn sync_log(&self) -> Result<Vec<LoggedSync>> {
        self.store.get().await?.list_log().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
