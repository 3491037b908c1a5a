//! The engine-facing remote cache for one region.
//!
//! A local-role facade has one active slot chosen from a priority-ordered
//! failover list and hands recovery to a background `FailoverCoordinator`. A
//! cluster-role facade fans out over every peer and never fails over.

use crate::config::RemoteCacheAttributes;
use crate::error::Result;
use crate::failover::{FailoverCoordinator, FailoverGuard, RegistryDirectory};
use crate::metrics::FacadeMetrics;
use crate::nowait::wrapper::{NoWaitStats, NoWaitWrapper};
use crate::service::LocalCache;
use crate::types::{CacheEntry, CacheStatus, Location, RemoteType};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Region name to facade lookup used by clients to trigger failover.
///
/// Holds weak references; the manager owns the facades.
#[derive(Debug, Default)]
pub struct FacadeDirectory {
    facades: DashMap<String, Weak<NoWaitFacade>>,
}

impl FacadeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `facade` reachable by its region name.
    pub fn register(&self, facade: &Arc<NoWaitFacade>) {
        self.facades
            .insert(facade.region().to_string(), Arc::downgrade(facade));
    }

    /// The live facade for `region`.
    pub fn get(&self, region: &str) -> Option<Arc<NoWaitFacade>> {
        self.facades.get(region).and_then(|f| f.upgrade())
    }

    pub fn remove(&self, region: &str) {
        self.facades.remove(region);
    }

    pub fn len(&self) -> usize {
        self.facades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facades.is_empty()
    }
}

/// Point-in-time view of a facade.
#[derive(Debug, Clone)]
pub struct FacadeStats {
    pub region: String,
    pub remote_type: RemoteType,
    pub status: CacheStatus,
    pub failover_index: usize,
    pub failover_running: bool,
    pub failovers_started: u64,
    pub failover_swaps: u64,
    pub primary_restores: u64,
    pub no_waits: Vec<NoWaitStats>,
}

/// One logical remote cache over one or more wrappers.
pub struct NoWaitFacade {
    attributes: RemoteCacheAttributes,
    no_waits: RwLock<Vec<Arc<NoWaitWrapper>>>,
    failover_index: AtomicUsize,
    directory: Arc<RegistryDirectory>,
    local: Arc<dyn LocalCache>,
    failover_running: Arc<AtomicBool>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    metrics: FacadeMetrics,
    this: Weak<NoWaitFacade>,
}

impl NoWaitFacade {
    /// Create a facade over `no_waits`; `failover_index` is the failover-list
    /// position of slot 0 for local-role facades.
    pub fn new(
        attributes: RemoteCacheAttributes,
        no_waits: Vec<Arc<NoWaitWrapper>>,
        failover_index: usize,
        directory: Arc<RegistryDirectory>,
        local: Arc<dyn LocalCache>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            attributes,
            no_waits: RwLock::new(no_waits),
            failover_index: AtomicUsize::new(failover_index),
            directory,
            local,
            failover_running: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            metrics: FacadeMetrics::new(),
            this: this.clone(),
        })
    }

    pub fn region(&self) -> &str {
        &self.attributes.region
    }

    pub fn attributes(&self) -> &RemoteCacheAttributes {
        &self.attributes
    }

    /// The local cache fed by this region's listeners.
    pub fn local(&self) -> &Arc<dyn LocalCache> {
        &self.local
    }

    /// Primary first, then failovers.
    pub fn failover_list(&self) -> Vec<Location> {
        self.attributes.failover_list()
    }

    /// Failover-list position of the active slot.
    pub fn failover_index(&self) -> usize {
        self.failover_index.load(Ordering::SeqCst)
    }

    /// Snapshot of the wrappers.
    pub fn no_waits(&self) -> Vec<Arc<NoWaitWrapper>> {
        self.no_waits.read().clone()
    }

    /// Wrapper in slot 0.
    pub fn active(&self) -> Option<Arc<NoWaitWrapper>> {
        self.no_waits.read().first().cloned()
    }

    /// Status of slot 0, `Disposed` when there is none.
    pub fn active_status(&self) -> CacheStatus {
        self.active()
            .map(|w| w.status())
            .unwrap_or(CacheStatus::Disposed)
    }

    pub fn is_failover_running(&self) -> bool {
        self.failover_running.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &FacadeMetrics {
        &self.metrics
    }

    /// Cancelled when the facade is disposed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install `wrapper` as the active slot and record its failover-list position.
    ///
    /// Both change under one write lock so readers never see a wrapper paired
    /// with another slot's index.
    pub fn swap_active(&self, wrapper: Arc<NoWaitWrapper>, index: usize) {
        let mut no_waits = self.no_waits.write();
        match no_waits.first_mut() {
            Some(slot) => *slot = wrapper,
            None => no_waits.push(wrapper),
        }
        self.failover_index.store(index, Ordering::SeqCst);
        drop(no_waits);
        info!(region = %self.attributes.region, failover_index = index, "Active remote connection swapped");
    }

    /// ALIVE if any wrapper is alive, otherwise DISPOSED.
    pub fn status(&self) -> CacheStatus {
        if self.is_disposed() {
            return CacheStatus::Disposed;
        }
        if self.no_waits.read().iter().any(|w| w.status().is_alive()) {
            CacheStatus::Alive
        } else {
            CacheStatus::Disposed
        }
    }

    pub fn stats(&self) -> FacadeStats {
        FacadeStats {
            region: self.attributes.region.clone(),
            remote_type: self.attributes.remote_type,
            status: self.status(),
            failover_index: self.failover_index(),
            failover_running: self.is_failover_running(),
            failovers_started: self.metrics.failovers_started.get(),
            failover_swaps: self.metrics.failover_swaps.get(),
            primary_restores: self.metrics.primary_restores.get(),
            no_waits: self.no_waits().iter().map(|w| w.stats()).collect(),
        }
    }

    /// Queue `entry` on every wrapper. A wrapper that refuses it triggers
    /// failover for its own slot; the remaining wrappers still get the entry.
    pub fn update(&self, entry: impl Into<CacheEntry>) -> Result<()> {
        let entry = entry.into();
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            if let Err(e) = no_wait.update(entry.clone()) {
                error!(region = %self.attributes.region, slot = i, key = entry.key(), error = %e, "Update failed");
                self.failover(i);
            }
        }
        Ok(())
    }

    /// First entry found, trying wrappers in order. Errors are logged and skipped.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            match no_wait.get(key).await {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    warn!(region = %self.attributes.region, slot = i, key, error = %e, "Get failed, trying next");
                }
            }
        }
        None
    }

    /// First successful pattern read; empty when every wrapper fails.
    pub async fn get_matching(&self, pattern: &str) -> HashMap<String, Option<CacheEntry>> {
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            match no_wait.get_matching(pattern).await {
                Ok(found) => return found,
                Err(e) => {
                    warn!(region = %self.attributes.region, slot = i, pattern, error = %e, "Get matching failed, trying next");
                }
            }
        }
        HashMap::new()
    }

    /// First successful multi-key read; empty when every wrapper fails.
    pub async fn get_multiple(&self, keys: &HashSet<String>) -> HashMap<String, Option<CacheEntry>> {
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            match no_wait.get_multiple(keys).await {
                Ok(found) => return found,
                Err(e) => {
                    warn!(region = %self.attributes.region, slot = i, error = %e, "Get multiple failed, trying next");
                }
            }
        }
        HashMap::new()
    }

    pub async fn get_key_set(&self) -> HashSet<String> {
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            match no_wait.get_key_set().await {
                Ok(keys) => return keys,
                Err(e) => {
                    warn!(region = %self.attributes.region, slot = i, error = %e, "Get key set failed, trying next");
                }
            }
        }
        HashSet::new()
    }

    pub fn remove(&self, key: &str) {
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            if let Err(e) = no_wait.remove(key) {
                error!(region = %self.attributes.region, slot = i, key, error = %e, "Remove failed");
            }
        }
    }

    pub fn remove_all(&self) {
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            if let Err(e) = no_wait.remove_all() {
                error!(region = %self.attributes.region, slot = i, error = %e, "Remove all failed");
            }
        }
    }

    /// Dispose every wrapper and stop any running failover.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(region = %self.attributes.region, "Disposing remote cache facade");
        self.shutdown.cancel();
        for (i, no_wait) in self.no_waits().iter().enumerate() {
            if let Err(e) = no_wait.dispose() {
                error!(region = %self.attributes.region, slot = i, error = %e, "Dispose failed");
            }
        }
    }

    /// Start recovering slot `index` in the background.
    ///
    /// No-op for cluster-role facades, when the slot is not in error, or while
    /// another failover for this facade is running.
    pub fn failover(&self, index: usize) {
        if self.attributes.remote_type == RemoteType::Cluster || self.is_disposed() {
            return;
        }

        let status = self.no_waits.read().get(index).map(|w| w.status());
        if status != Some(CacheStatus::Error) {
            debug!(region = %self.attributes.region, slot = index, ?status, "Slot not in error, no failover");
            return;
        }

        if self
            .failover_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(region = %self.attributes.region, "Failover already running");
            return;
        }
        let guard = FailoverGuard::new(self.failover_running.clone());

        let Some(facade) = self.this.upgrade() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(region = %self.attributes.region, "No runtime, cannot start failover");
                return;
            }
        };

        self.metrics.failovers_started.inc();
        info!(
            region = %self.attributes.region,
            slot = index,
            failover_index = self.failover_index(),
            "Starting failover"
        );
        let coordinator = FailoverCoordinator::new(facade, self.directory.clone()).with_guard(guard);
        runtime.spawn(coordinator.run());
    }
}

impl std::fmt::Debug for NoWaitFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoWaitFacade")
            .field("region", &self.attributes.region)
            .field("remote_type", &self.attributes.remote_type)
            .field("failover_index", &self.failover_index())
            .field("no_waits", &self.no_waits.read().len())
            .finish()
    }
}
