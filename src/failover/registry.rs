//! Connections to remote endpoints, one registry per (location, service name).
//!
//! A registry owns the service and observer handles for its endpoint and the
//! wrapper of every region served through it. Handles and the region map
//! change only under the registry's lock, so a reconnect fixes every region
//! of the endpoint in one step.

use crate::client::{ObserverHandle, RemoteCacheClient, RemoteCacheListener, ServiceHandle};
use crate::config::RemoteCacheAttributes;
use crate::error::Result;
use crate::failover::monitor::MonitorSignal;
use crate::nowait::{FacadeDirectory, NoWaitWrapper};
use crate::service::{CacheEventListener, ConnectionResolver, LocalCache, ResolvedConnection};
use crate::types::{CacheStatus, Location};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct RegistryState {
    service: ServiceHandle,
    observer: ObserverHandle,
    caches: HashMap<String, Arc<NoWaitWrapper>>,
}

/// Connection to one endpoint and the regions served through it.
pub struct ConnectionRegistry {
    location: Location,
    service_name: String,
    resolver: Arc<dyn ConnectionResolver>,
    signal: Arc<MonitorSignal>,
    facades: Arc<FacadeDirectory>,
    state: Mutex<RegistryState>,
    references: AtomicUsize,
}

impl ConnectionRegistry {
    /// Resolve the endpoint. When that fails the registry starts on zombie
    /// handles and the monitor is told.
    pub async fn connect(
        location: Location,
        attributes: &RemoteCacheAttributes,
        resolver: Arc<dyn ConnectionResolver>,
        signal: Arc<MonitorSignal>,
        facades: Arc<FacadeDirectory>,
    ) -> Self {
        let service_name = attributes.service_name.clone();
        let (service, observer) = match resolver.resolve(&location, &service_name).await {
            Ok(ResolvedConnection { service, observer }) => {
                info!(location = %location, service = %service_name, "Connected to remote cache server");
                (ServiceHandle::Live(service), ObserverHandle::Live(observer))
            }
            Err(e) => {
                warn!(location = %location, service = %service_name, error = %e, "Remote cache server unreachable, using zombie");
                signal.notify_error();
                (
                    ServiceHandle::zombie(
                        attributes.zombie_queue_max_size,
                        attributes.zombie_overflow_policy,
                    ),
                    ObserverHandle::zombie(),
                )
            }
        };

        Self {
            location,
            service_name,
            resolver,
            signal,
            facades,
            state: Mutex::new(RegistryState {
                service,
                observer,
                caches: HashMap::new(),
            }),
            references: AtomicUsize::new(0),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Regions currently holding this registry.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }

    /// Whether the service handle is live.
    pub async fn is_connected(&self) -> bool {
        !self.state.lock().await.service.is_zombie()
    }

    /// The wrapper for `region`, if one was created.
    pub async fn cache(&self, region: &str) -> Option<Arc<NoWaitWrapper>> {
        self.state.lock().await.caches.get(region).cloned()
    }

    pub async fn regions(&self) -> Vec<String> {
        self.state.lock().await.caches.keys().cloned().collect()
    }

    /// Whether any wrapper of this registry is in error.
    pub async fn has_errored_caches(&self) -> bool {
        self.state
            .lock()
            .await
            .caches
            .values()
            .any(|w| w.status() == CacheStatus::Error)
    }

    /// The wrapper for the attributes' region, created on first use.
    ///
    /// Creating a wrapper takes a reference on the registry, given back by
    /// `release`. A new wrapper's listener is registered with the observer unless
    /// receiving is disabled. A failed registration is reported to the
    /// monitor and the wrapper is still returned.
    pub async fn get_cache(
        &self,
        attributes: &RemoteCacheAttributes,
        local: Arc<dyn LocalCache>,
    ) -> Arc<NoWaitWrapper> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.caches.get(&attributes.region) {
            return existing.clone();
        }

        let listener = Arc::new(RemoteCacheListener::new(attributes, local));
        if attributes.receive {
            match state
                .observer
                .observer()
                .add_cache_listener(&attributes.region, listener.clone())
                .await
            {
                Ok(id) => {
                    listener.set_listener_id(id);
                    debug!(region = %attributes.region, location = %self.location, listener_id = id, "Listener registered");
                }
                Err(e) => {
                    warn!(region = %attributes.region, location = %self.location, error = %e, "Listener registration failed");
                    self.signal.notify_error();
                }
            }
        } else {
            debug!(region = %attributes.region, "Receive disabled, listener not registered");
        }

        let client = Arc::new(RemoteCacheClient::new(
            attributes.clone(),
            state.service.clone(),
            listener,
            self.signal.clone(),
            self.facades.clone(),
        ));
        let wrapper = Arc::new(NoWaitWrapper::new(client));
        state
            .caches
            .insert(attributes.region.clone(), wrapper.clone());
        let references = self.references.fetch_add(1, Ordering::SeqCst) + 1;
        info!(region = %attributes.region, location = %self.location, references, "Remote cache region created");
        wrapper
    }

    /// Deregister the region's listener from this endpoint.
    pub async fn remove_remote_cache_listener(&self, attributes: &RemoteCacheAttributes) -> Result<()> {
        if !attributes.receive {
            return Ok(());
        }
        let state = self.state.lock().await;
        let Some(wrapper) = state.caches.get(&attributes.region) else {
            return Ok(());
        };
        let listener_id = wrapper.client().listener_id();
        state
            .observer
            .observer()
            .remove_cache_listener(&attributes.region, listener_id)
            .await?;
        debug!(region = %attributes.region, location = %self.location, listener_id, "Listener deregistered");
        Ok(())
    }

    /// Install freshly resolved handles and fix every wrapper.
    ///
    /// Listeners parked on a zombie observer are registered with the new one
    /// before the wrappers pick up their fresh delivery queues.
    pub async fn fix_caches(&self, resolved: ResolvedConnection) {
        let mut state = self.state.lock().await;

        if let ObserverHandle::Zombie(zombie) = &state.observer {
            let repaired = zombie.repair(resolved.observer.as_ref()).await;
            debug!(location = %self.location, repaired, "Listener registrations restored");
        }
        state.observer = ObserverHandle::Live(resolved.observer);

        let service = ServiceHandle::Live(resolved.service);
        state.service = service.clone();
        for wrapper in state.caches.values() {
            wrapper.fix_cache(service.clone()).await;
        }
        info!(location = %self.location, regions = state.caches.len(), "Registry caches fixed");
    }

    /// Resolve the endpoint again and fix every wrapper on success.
    pub async fn reconnect(&self) -> Result<()> {
        let resolved = self
            .resolver
            .resolve(&self.location, &self.service_name)
            .await?;
        self.fix_caches(resolved).await;
        Ok(())
    }

    /// Drop the region's wrapper and its reference: the listener is
    /// deregistered and a dispose is queued unless one already was.
    ///
    /// Returns the references left; at zero the registry serves nothing.
    pub async fn release(&self, region: &str) -> usize {
        let mut state = self.state.lock().await;
        match state.caches.remove(region) {
            Some(wrapper) => {
                Self::release_wrapper(&state.observer, &wrapper).await;
                self.references.fetch_sub(1, Ordering::SeqCst) - 1
            }
            None => self.references(),
        }
    }

    /// Drop every wrapper and reference.
    pub async fn release_all(&self) {
        let mut state = self.state.lock().await;
        let caches: Vec<_> = state.caches.drain().map(|(_, w)| w).collect();
        for wrapper in &caches {
            Self::release_wrapper(&state.observer, wrapper).await;
        }
        self.references.store(0, Ordering::SeqCst);
        info!(location = %self.location, released = caches.len(), "Registry released");
    }

    async fn release_wrapper(observer: &ObserverHandle, wrapper: &NoWaitWrapper) {
        let region = wrapper.region().to_string();
        if wrapper.client().attributes().receive {
            let listener_id = wrapper.client().listener_id();
            if let Err(e) = observer
                .observer()
                .remove_cache_listener(&region, listener_id)
                .await
            {
                debug!(region = %region, error = %e, "Listener deregistration on release failed");
            }
        }
        if wrapper.queue().is_working() && !wrapper.is_disposed() {
            if let Err(e) = wrapper.dispose() {
                debug!(region = %region, error = %e, "Dispose on release not queued");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("location", &self.location)
            .field("service_name", &self.service_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    location: Location,
    service_name: String,
}

/// Every registry of one manager, keyed by (location, service name).
pub struct RegistryDirectory {
    resolver: Arc<dyn ConnectionResolver>,
    signal: Arc<MonitorSignal>,
    facades: Arc<FacadeDirectory>,
    registries: Mutex<HashMap<RegistryKey, Arc<ConnectionRegistry>>>,
}

impl RegistryDirectory {
    pub fn new(
        resolver: Arc<dyn ConnectionResolver>,
        signal: Arc<MonitorSignal>,
        facades: Arc<FacadeDirectory>,
    ) -> Self {
        Self {
            resolver,
            signal,
            facades,
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn signal(&self) -> &Arc<MonitorSignal> {
        &self.signal
    }

    pub fn facades(&self) -> &Arc<FacadeDirectory> {
        &self.facades
    }

    /// The registry for `location`, connecting it on first use.
    pub async fn get_or_connect(
        &self,
        location: &Location,
        attributes: &RemoteCacheAttributes,
    ) -> Arc<ConnectionRegistry> {
        let key = RegistryKey {
            location: location.clone(),
            service_name: attributes.service_name.clone(),
        };
        let mut registries = self.registries.lock().await;
        if let Some(registry) = registries.get(&key) {
            return registry.clone();
        }

        let registry = Arc::new(
            ConnectionRegistry::connect(
                location.clone(),
                attributes,
                self.resolver.clone(),
                self.signal.clone(),
                self.facades.clone(),
            )
            .await,
        );
        registries.insert(key, registry.clone());
        registry
    }

    /// The registry for `location`, if one exists.
    pub async fn get(&self, location: &Location, service_name: &str) -> Option<Arc<ConnectionRegistry>> {
        let key = RegistryKey {
            location: location.clone(),
            service_name: service_name.to_string(),
        };
        self.registries.lock().await.get(&key).cloned()
    }

    /// Release `region` from the registry at `location`. The registry is
    /// forgotten once no region holds it. Returns the references left.
    pub async fn release(&self, location: &Location, service_name: &str, region: &str) -> usize {
        let key = RegistryKey {
            location: location.clone(),
            service_name: service_name.to_string(),
        };
        let mut registries = self.registries.lock().await;
        let Some(registry) = registries.get(&key).cloned() else {
            return 0;
        };
        let left = registry.release(region).await;
        if left == 0 {
            registries.remove(&key);
            info!(location = %location, service = %service_name, "Registry no longer referenced, dropped");
        }
        left
    }

    /// Snapshot of every registry.
    pub async fn registries(&self) -> Vec<Arc<ConnectionRegistry>> {
        self.registries.lock().await.values().cloned().collect()
    }

    /// Release and forget every registry.
    pub async fn shutdown(&self) {
        let registries: Vec<_> = self
            .registries
            .lock()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect();
        for registry in registries {
            registry.release_all().await;
        }
    }
}

impl std::fmt::Debug for RegistryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDirectory").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{wait_until, MockResolver, RecordingLocalCache};
    use crate::types::{CacheElement, LISTENER_UNREGISTERED};

    fn setup() -> (Arc<MockResolver>, RegistryDirectory) {
        let resolver = Arc::new(MockResolver::new());
        let dir = RegistryDirectory::new(
            resolver.clone(),
            Arc::new(MonitorSignal::new()),
            Arc::new(FacadeDirectory::new()),
        );
        (resolver, dir)
    }

    fn attrs(location: &Location) -> RemoteCacheAttributes {
        RemoteCacheAttributes::new("users", location.clone())
    }

    #[tokio::test]
    async fn test_one_registry_per_location() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        resolver.add_endpoint(&location);

        let a = dir.get_or_connect(&location, &attrs(&location)).await;
        let b = dir.get_or_connect(&location, &attrs(&location)).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.resolve_count(&location), 1);
        assert!(a.is_connected().await);
    }

    #[tokio::test]
    async fn test_get_cache_registers_listener_once() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        resolver.add_endpoint(&location);
        let registry = dir.get_or_connect(&location, &attrs(&location)).await;
        let local = Arc::new(RecordingLocalCache::new());

        let first = registry.get_cache(&attrs(&location), local.clone()).await;
        let second = registry.get_cache(&attrs(&location), local).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.observer(&location).registered("users").len(), 1);
        assert!(first.client().listener_id() > 0);
    }

    #[tokio::test]
    async fn test_receive_disabled_skips_registration() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        resolver.add_endpoint(&location);
        let attrs = attrs(&location).with_receive(false);
        let registry = dir.get_or_connect(&location, &attrs).await;

        let wrapper = registry
            .get_cache(&attrs, Arc::new(RecordingLocalCache::new()))
            .await;
        assert!(resolver.observer(&location).registered("users").is_empty());
        assert_eq!(wrapper.client().listener_id(), LISTENER_UNREGISTERED);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_starts_on_zombie() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        let registry = dir.get_or_connect(&location, &attrs(&location)).await;

        assert!(!registry.is_connected().await);
        assert!(!dir.signal().is_all_right());
        let wrapper = registry
            .get_cache(&attrs(&location), Arc::new(RecordingLocalCache::new()))
            .await;
        assert_eq!(wrapper.status(), CacheStatus::Error);
        assert!(registry.has_errored_caches().await);
        assert!(registry.reconnect().await.is_err());

        resolver.add_endpoint(&location);
        registry.reconnect().await.unwrap();
        assert!(registry.is_connected().await);
        assert_eq!(wrapper.status(), CacheStatus::Alive);
        assert!(wrapper.client().listener_id() > 0);
        assert_eq!(resolver.observer(&location).registered("users").len(), 1);
    }

    #[tokio::test]
    async fn test_fix_caches_replays_buffered_writes() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        let registry = dir.get_or_connect(&location, &attrs(&location)).await;
        let wrapper = registry
            .get_cache(&attrs(&location), Arc::new(RecordingLocalCache::new()))
            .await;

        for key in ["a", "b"] {
            wrapper.update(CacheElement::new("users", key, "v")).unwrap();
        }
        wait_until(|| wrapper.queue().stats().processed == 2).await;

        let service = resolver.add_endpoint(&location);
        registry.reconnect().await.unwrap();
        assert_eq!(service.calls(), vec!["update:users:a", "update:users:b"]);
    }

    #[tokio::test]
    async fn test_remove_listener_and_release() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        resolver.add_endpoint(&location);
        let registry = dir.get_or_connect(&location, &attrs(&location)).await;
        registry
            .get_cache(&attrs(&location), Arc::new(RecordingLocalCache::new()))
            .await;

        registry
            .remove_remote_cache_listener(&attrs(&location))
            .await
            .unwrap();
        assert!(resolver.observer(&location).registered("users").is_empty());

        assert_eq!(registry.references(), 1);
        assert_eq!(registry.release("users").await, 0);
        assert_eq!(registry.release("users").await, 0);
        assert!(registry.cache("users").await.is_none());

        dir.shutdown().await;
        assert!(dir.registries().await.is_empty());
    }

    #[tokio::test]
    async fn test_directory_drops_registry_after_last_release() {
        let (resolver, dir) = setup();
        let location = Location::new("primary", 1102);
        resolver.add_endpoint(&location);
        let users = attrs(&location);
        let orders = RemoteCacheAttributes::new("orders", location.clone());
        let registry = dir.get_or_connect(&location, &users).await;
        registry.get_cache(&users, Arc::new(RecordingLocalCache::new())).await;
        registry.get_cache(&orders, Arc::new(RecordingLocalCache::new())).await;
        registry.get_cache(&users, Arc::new(RecordingLocalCache::new())).await;
        assert_eq!(registry.references(), 2);

        assert_eq!(dir.release(&location, &users.service_name, "users").await, 1);
        assert_eq!(dir.registries().await.len(), 1);

        assert_eq!(dir.release(&location, &orders.service_name, "orders").await, 0);
        assert!(dir.registries().await.is_empty());
        assert!(dir.get(&location, &orders.service_name).await.is_none());

        // A later lookup connects afresh.
        dir.get_or_connect(&location, &users).await;
        assert_eq!(resolver.resolve_count(&location), 2);
    }
}
