use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshvault_locks::LockManager;
use meshvault_storage::{DataSource, NodeFilter};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::config_set::ConfigSet;
use crate::cooldown::{CooldownGate, CooldownKey};
use crate::error::{Error, Result};
use crate::workers::WorkerPool;

/// Current time in unix seconds.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Whole seconds of a duration, saturating.
pub(crate) fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Group that takes small files until it has received its share.
#[derive(Debug)]
pub(crate) struct StickyGroup {
    pub(crate) group: String,
    pub(crate) files: u32,
}

struct Inner<D, L> {
    config: CoordinatorConfig,
    cooldowns: CooldownGate<D>,
    locks: L,
    settings: ConfigSet,
    sticky: Mutex<Option<StickyGroup>>,
    store: D,
    workers: WorkerPool,
}

/// Handle to the replication control plane.
///
/// Cloning is cheap; every clone shares the same collaborators, runtime
/// tunables and worker pool.
pub struct Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    inner: Arc<Inner<D, L>>,
}

impl<D, L> Clone for Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, L> std::fmt::Debug for Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.inner.workers)
            .finish_non_exhaustive()
    }
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Wires the coordinator to its collaborators and starts the worker
    /// pool. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(store: D, locks: L, config: CoordinatorConfig) -> Self {
        let workers = WorkerPool::new(&config.workers);
        let cooldowns = CooldownGate::new(store.clone(), config.cooldowns.clone());

        info!(
            "coordinator ready with {} workers",
            config.workers.workers.max(1)
        );

        Self {
            inner: Arc::new(Inner {
                config,
                cooldowns,
                locks,
                settings: ConfigSet::new(),
                sticky: Mutex::new(None),
                store,
                workers,
            }),
        }
    }

    /// Static configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Runtime tunables.
    #[must_use]
    pub fn settings(&self) -> &ConfigSet {
        &self.inner.settings
    }

    /// The persistence collaborator.
    #[must_use]
    pub fn store(&self) -> &D {
        &self.inner.store
    }

    /// Reloads runtime tunables from the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store could not be read.
    pub async fn refresh_settings(&self) -> Result<usize> {
        let entries = self
            .inner
            .store
            .config_entries()
            .await
            .map_err(Error::persistence)?;

        Ok(self.inner.settings.merge(entries))
    }

    /// Waits until all background jobs queued so far have run.
    pub async fn wait_idle(&self) {
        self.inner.workers.wait_idle().await;
    }

    /// Stops the worker pool.
    pub async fn shutdown(&self) {
        self.inner.workers.shutdown().await;
    }

    pub(crate) async fn cooldown(&self, key: CooldownKey<'_>) -> Result<bool> {
        self.inner.cooldowns.try_acquire(key).await
    }

    pub(crate) fn submit<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.workers.submit(label, work);
    }

    pub(crate) fn sticky(&self) -> &Mutex<Option<StickyGroup>> {
        &self.inner.sticky
    }

    /// Runs `operation` while holding the ledger lock `key`.
    ///
    /// The lock is released whatever the outcome; a failed release is logged
    /// and left to the lock TTL.
    pub(crate) async fn with_lock<T, F>(&self, key: String, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let locks = &self.inner.config.locks;
        let token = self
            .inner
            .locks
            .try_acquire(key.clone(), locks.ttl, locks.wait)
            .await
            .map_err(Error::lock)?;

        let Some(token) = token else {
            warn!("could not lock {} within {:?}", key, locks.wait);
            return Err(Error::LockUnavailable(key));
        };

        let result = operation.await;

        if let Err(e) = self.inner.locks.release(key.clone(), token).await {
            warn!("failed to release lock {}: {}", key, e);
        }

        result
    }

    /// Candidates that may join a group.
    pub(crate) fn candidate_filter(&self, active_ceiling: Option<u32>) -> NodeFilter {
        let nodes = &self.inner.config.nodes;
        let now = unix_now();

        NodeFilter {
            min_free_space: nodes.node_capacity,
            updated_after: now - secs(nodes.candidate_liveness),
            registered_before: now - secs(nodes.maturity),
            max_active_groups: active_ceiling,
            min_online_count: nodes.min_online_count,
            ungrouped_only: false,
        }
    }

    /// Online nodes that may receive new files or seed a group.
    pub(crate) fn placement_filter(&self, active_ceiling: Option<u32>) -> NodeFilter {
        let nodes = &self.inner.config.nodes;

        NodeFilter {
            updated_after: unix_now() - secs(nodes.liveness),
            ..self.candidate_filter(active_ceiling)
        }
    }
}
