//! Top-level owner of registries, facades and the health monitor.
//!
//! One manager per process (or per test). Everything it creates is reachable
//! from it and released by `shutdown`.

use crate::config::{ManagerConfig, RemoteCacheAttributes};
use crate::error::{Error, Result};
use crate::failover::{HealthMonitor, MonitorSignal, RegistryDirectory};
use crate::nowait::{FacadeDirectory, FacadeStats, NoWaitFacade};
use crate::service::{ConnectionResolver, LocalCache};
use crate::types::{CacheStatus, RemoteType};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Creates and owns one facade per region.
pub struct RemoteCacheManager {
    config: ManagerConfig,
    directory: Arc<RegistryDirectory>,
    facades: Arc<FacadeDirectory>,
    caches: DashMap<String, Arc<NoWaitFacade>>,
    monitor: Arc<HealthMonitor>,
    creating: Mutex<()>,
    shut_down: AtomicBool,
}

impl RemoteCacheManager {
    /// Create a manager over `resolver`. Must be called inside a tokio runtime
    /// when the monitor is started.
    pub fn new(resolver: Arc<dyn ConnectionResolver>, config: ManagerConfig) -> Self {
        let signal = Arc::new(MonitorSignal::new());
        let facades = Arc::new(FacadeDirectory::new());
        let directory = Arc::new(RegistryDirectory::new(resolver, signal, facades.clone()));
        let monitor = HealthMonitor::new(config.monitor.clone(), directory.clone());
        if config.start_monitor {
            monitor.start();
        }

        Self {
            config,
            directory,
            facades,
            caches: DashMap::new(),
            monitor,
            creating: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn directory(&self) -> &Arc<RegistryDirectory> {
        &self.directory
    }

    /// The facade for `region`, if created.
    pub fn facade(&self, region: &str) -> Option<Arc<NoWaitFacade>> {
        self.caches.get(region).map(|f| f.clone())
    }

    pub fn regions(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> Vec<FacadeStats> {
        self.caches.iter().map(|e| e.value().stats()).collect()
    }

    /// The facade for the attributes' region, created on first use.
    ///
    /// A local-role facade starts on the primary. When the primary is not
    /// reachable a failover is started right away.
    pub async fn get_cache(
        &self,
        attributes: RemoteCacheAttributes,
        local: Arc<dyn LocalCache>,
    ) -> Result<Arc<NoWaitFacade>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Disposed("remote cache manager".into()));
        }
        attributes.validate()?;

        let _creating = self.creating.lock().await;
        if let Some(existing) = self.facade(&attributes.region) {
            return Ok(existing);
        }

        let facade = match attributes.remote_type {
            RemoteType::Local => self.create_local(attributes, local).await,
            RemoteType::Cluster => self.create_cluster(attributes, local).await,
        };
        self.facades.register(&facade);
        self.caches
            .insert(facade.region().to_string(), facade.clone());

        if facade.attributes().remote_type == RemoteType::Local
            && facade.active_status() == CacheStatus::Error
        {
            warn!(region = %facade.region(), "Primary unavailable at startup");
            facade.failover(0);
        }

        info!(
            region = %facade.region(),
            remote_type = %facade.attributes().remote_type,
            servers = facade.no_waits().len(),
            "Remote cache facade created"
        );
        Ok(facade)
    }

    async fn create_local(
        &self,
        attributes: RemoteCacheAttributes,
        local: Arc<dyn LocalCache>,
    ) -> Arc<NoWaitFacade> {
        let mut no_waits = Vec::with_capacity(1);
        if let Some(primary) = attributes.failover_list().first() {
            let registry = self.directory.get_or_connect(primary, &attributes).await;
            no_waits.push(registry.get_cache(&attributes, local.clone()).await);
        }
        NoWaitFacade::new(attributes, no_waits, 0, self.directory.clone(), local)
    }

    async fn create_cluster(
        &self,
        attributes: RemoteCacheAttributes,
        local: Arc<dyn LocalCache>,
    ) -> Arc<NoWaitFacade> {
        let mut no_waits = Vec::with_capacity(attributes.cluster_servers.len());
        for peer in &attributes.cluster_servers {
            let registry = self.directory.get_or_connect(peer, &attributes).await;
            no_waits.push(registry.get_cache(&attributes, local.clone()).await);
        }
        NoWaitFacade::new(attributes, no_waits, 0, self.directory.clone(), local)
    }

    /// Dispose the region's facade and release its wrappers. Returns whether it existed.
    pub async fn free_cache(&self, region: &str) -> bool {
        let _creating = self.creating.lock().await;
        let Some((_, facade)) = self.caches.remove(region) else {
            return false;
        };
        self.facades.remove(region);
        facade.dispose();

        let attributes = facade.attributes();
        let locations = match attributes.remote_type {
            RemoteType::Local => attributes.failover_list(),
            RemoteType::Cluster => attributes.cluster_servers.clone(),
        };
        for location in &locations {
            self.directory
                .release(location, &attributes.service_name, region)
                .await;
        }
        info!(region, "Remote cache freed");
        true
    }

    /// Stop the monitor, dispose every facade and release every registry.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(regions = self.caches.len(), "Shutting down remote cache manager");
        self.monitor.shutdown().await;

        let facades: Vec<_> = self.caches.iter().map(|e| e.value().clone()).collect();
        self.caches.clear();
        for facade in facades {
            self.facades.remove(facade.region());
            facade.dispose();
        }
        self.directory.shutdown().await;
    }
}

impl std::fmt::Debug for RemoteCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCacheManager")
            .field("regions", &self.regions())
            .field("monitor", &self.monitor)
            .finish()
    }
}
