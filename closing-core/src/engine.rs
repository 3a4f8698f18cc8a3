//! Closing engine
//!
//! Wires the backing store, lock manager, fingerprint validator, repository
//! and orchestrator from a [`Config`].

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::fingerprint::FingerprintValidator;
use crate::lock::{LockManager, PrivilegedCaller};
use crate::metrics::Metrics;
use crate::operation::{
    ActiveOperationView, HistoryPage, HistoryQuery, OperationStats, PendingOperation, SubmitOutcome,
    SubmitRequest,
};
use crate::orchestrator::Orchestrator;
use crate::repository::{ClosingRepository, StoreClosingRepository};
use crate::scheduler::{EvictionTask, HistoryRetentionTask, LockSweepTask, SweepScheduler};
use crate::store::{BackingStore, FailoverStore, MemoryStore, RedisStore};
use crate::Result;
use notification_bus::{NoopSink, NotificationSink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Closing engine
pub struct ClosingEngine {
    config: Config,
    store: Arc<dyn BackingStore>,
    orchestrator: Arc<Orchestrator>,
    metrics: Metrics,
}

impl ClosingEngine {
    /// Create engine, connecting to Redis when configured
    pub async fn new(config: Config, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = connect_store(&config, clock.clone()).await?;

        Self::builder(config)
            .clock(clock)
            .store(store)
            .sink(sink)
            .build()
    }

    /// Builder for injecting collaborators
    pub fn builder(config: Config) -> ClosingEngineBuilder {
        ClosingEngineBuilder {
            config,
            clock: None,
            store: None,
            repository: None,
            sink: None,
        }
    }

    /// Submit a closing
    pub async fn submit(&self, request: SubmitRequest) -> SubmitOutcome {
        self.orchestrator.submit(request).await
    }

    /// Active operations
    pub fn list_active(&self) -> Vec<ActiveOperationView> {
        self.orchestrator.list_active()
    }

    /// History page
    pub fn list_history(&self, query: &HistoryQuery) -> HistoryPage {
        self.orchestrator.list_history(query)
    }

    /// Operation by ID
    pub fn get_operation(&self, id: Uuid) -> Result<PendingOperation> {
        self.orchestrator.get_operation(id)
    }

    /// Orchestrator counters
    pub fn stats(&self) -> OperationStats {
        self.orchestrator.stats()
    }

    /// Administrative lock override
    pub async fn force_release(
        &self,
        caller: &PrivilegedCaller,
        cashier_id: &str,
        operation_type: Option<&str>,
    ) -> Result<usize> {
        self.orchestrator
            .force_release(caller, cashier_id, operation_type)
            .await
    }

    /// Whether locks run on the in-process fallback
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    /// Scheduler with the lock sweep, eviction and retention tasks
    pub fn scheduler(&self) -> SweepScheduler {
        let operation = &self.config.operation;
        let mut scheduler = SweepScheduler::new();
        scheduler
            .register(Arc::new(LockSweepTask::new(
                self.orchestrator.lock_manager().clone(),
                Duration::from_secs(self.config.lock.sweep_interval_secs),
            )))
            .register(Arc::new(EvictionTask::new(
                self.orchestrator.clone(),
                Duration::from_secs(operation.eviction_interval_secs),
            )))
            .register(Arc::new(HistoryRetentionTask::new(
                self.orchestrator.clone(),
                Duration::from_secs(operation.history_sweep_interval_secs),
            )));
        scheduler
    }

    /// Orchestrator
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shutdown engine
    pub async fn shutdown(self) -> Result<()> {
        info!(active = self.orchestrator.list_active().len(), "Shutting down closing engine");
        Ok(())
    }
}

/// Builder for [`ClosingEngine`]
pub struct ClosingEngineBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn BackingStore>>,
    repository: Option<Arc<dyn ClosingRepository>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl ClosingEngineBuilder {
    /// Time source (default: system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Backing store (default: in-process store)
    pub fn store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Closing repository (default: on the backing store)
    pub fn repository(mut self, repository: Arc<dyn ClosingRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Notification sink (default: discard)
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Assemble the engine
    pub fn build(self) -> Result<ClosingEngine> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock.clone())));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(StoreClosingRepository::new(store.clone())));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));
        let metrics = Metrics::new()?;

        let locks = Arc::new(LockManager::new(
            store.clone(),
            clock.clone(),
            sink.clone(),
            metrics.clone(),
            format!("{}.lock", config.notification.source),
        ));
        let fingerprints = FingerprintValidator::new(store.clone(), config.dedupe_window());

        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            locks,
            fingerprints,
            repository,
            clock,
            sink,
            metrics.clone(),
        )?);

        info!(
            service = %config.service_name,
            version = %config.service_version,
            store = store.name(),
            lock_ttl_secs = config.lock.ttl_secs,
            "Closing engine ready"
        );

        Ok(ClosingEngine {
            config,
            store,
            orchestrator,
            metrics,
        })
    }
}

/// Backing store for `config`: Redis (optionally behind the in-process
/// fallback) when a URL is set, otherwise the in-process store alone.
///
/// With the fallback enabled an unreachable Redis does not fail startup: the
/// store starts degraded and connects on a later call.
pub async fn connect_store(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn BackingStore>> {
    let Some(url) = config.store.redis_url.as_deref() else {
        info!("No Redis URL configured, using in-process store");
        return Ok(Arc::new(MemoryStore::new(clock)));
    };
    let key_prefix = config.store.key_prefix.clone();

    if !config.lock.fallback_enabled {
        return Ok(Arc::new(RedisStore::connect(url, key_prefix).await?));
    }

    let (redis, reachable) = match RedisStore::connect(url, key_prefix.clone()).await {
        Ok(redis) => (redis, true),
        Err(e) => {
            warn!(
                "Redis unreachable at startup, starting on in-process fallback \
                 (mutual exclusion limited to this instance): {}",
                e
            );
            (RedisStore::open(url, key_prefix)?, false)
        }
    };

    let store = FailoverStore::new(Arc::new(redis), Arc::new(MemoryStore::new(clock)));
    if !reachable {
        store.mark_degraded();
    }
    Ok(Arc::new(store))
}
