//! Balking stand-ins used while an endpoint is unreachable.
//!
//! A zombie service answers reads with nothing and buffers writes, bounded by
//! the configured size, until a live handle arrives. The buffered writes are
//! then replayed against it in submission order.

use crate::config::ZombieOverflowPolicy;
use crate::error::{Error, Result};
use crate::metrics::Counter;
use crate::service::{CacheEventListener, RemoteCacheObserver, RemoteCacheService};
use crate::types::{CacheEntry, ListenerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Connection to one endpoint: live, or a zombie placeholder.
#[derive(Clone)]
pub enum ServiceHandle {
    /// A resolved, reachable service.
    Live(Arc<dyn RemoteCacheService>),
    /// Placeholder buffering writes while disconnected.
    Zombie(Arc<ZombieService>),
}

impl ServiceHandle {
    /// A fresh zombie handle.
    pub fn zombie(max_size: usize, policy: ZombieOverflowPolicy) -> Self {
        ServiceHandle::Zombie(Arc::new(ZombieService::new(max_size, policy)))
    }

    /// Check if this is a zombie placeholder.
    pub fn is_zombie(&self) -> bool {
        matches!(self, ServiceHandle::Zombie(_))
    }

    /// The handle as a service to call.
    pub fn service(&self) -> Arc<dyn RemoteCacheService> {
        match self {
            ServiceHandle::Live(service) => service.clone(),
            ServiceHandle::Zombie(zombie) => zombie.clone(),
        }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceHandle::Live(_) => write!(f, "ServiceHandle::Live"),
            ServiceHandle::Zombie(z) => write!(f, "ServiceHandle::Zombie(queued={})", z.queue_len()),
        }
    }
}

/// A write recorded while disconnected.
#[derive(Debug, Clone, PartialEq)]
pub enum ZombieEvent {
    Put {
        entry: CacheEntry,
        requester_id: ListenerId,
    },
    Remove {
        region: String,
        key: String,
        requester_id: ListenerId,
    },
    RemoveAll {
        region: String,
        requester_id: ListenerId,
    },
    Dispose {
        region: String,
    },
}

impl ZombieEvent {
    async fn replay(self, service: &dyn RemoteCacheService) -> Result<()> {
        match self {
            ZombieEvent::Put {
                entry,
                requester_id,
            } => service.update(entry, requester_id).await,
            ZombieEvent::Remove {
                region,
                key,
                requester_id,
            } => service.remove(&region, &key, requester_id).await.map(|_| ()),
            ZombieEvent::RemoveAll {
                region,
                requester_id,
            } => service.remove_all(&region, requester_id).await,
            ZombieEvent::Dispose { region } => service.dispose(&region).await,
        }
    }
}

/// Disconnected stand-in for a `RemoteCacheService`.
#[derive(Debug)]
pub struct ZombieService {
    events: Mutex<VecDeque<ZombieEvent>>,
    max_size: usize,
    policy: ZombieOverflowPolicy,
    dropped: Counter,
}

impl ZombieService {
    /// Create an empty zombie holding at most `max_size` events.
    pub fn new(max_size: usize, policy: ZombieOverflowPolicy) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_size,
            policy,
            dropped: Counter::new("zombie_dropped", "Events discarded while disconnected"),
        }
    }

    /// Number of buffered events.
    pub fn queue_len(&self) -> usize {
        self.events.lock().len()
    }

    /// Events discarded because the buffer was full or replay stopped early.
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    fn record(&self, event: ZombieEvent) -> Result<()> {
        let mut events = self.events.lock();
        if events.len() < self.max_size {
            events.push_back(event);
            return Ok(());
        }

        self.dropped.inc();
        match self.policy {
            ZombieOverflowPolicy::RejectNewest => {
                warn!(max = self.max_size, "Zombie queue full, discarding new event");
                Ok(())
            }
            ZombieOverflowPolicy::DropOldest => {
                events.pop_front();
                events.push_back(event);
                debug!(max = self.max_size, "Zombie queue full, discarded oldest event");
                Ok(())
            }
            ZombieOverflowPolicy::Fail => Err(Error::RemoteIo(format!(
                "zombie queue full ({} events)",
                self.max_size
            ))),
        }
    }

    /// Replay every buffered event against `service`, oldest first.
    ///
    /// Stops at the first failure; the events not yet replayed are discarded.
    /// Returns the number of events delivered.
    pub async fn propagate_events(&self, service: &dyn RemoteCacheService) -> Result<usize> {
        let pending: Vec<ZombieEvent> = self.events.lock().drain(..).collect();
        let total = pending.len();
        if total == 0 {
            return Ok(0);
        }

        info!(count = total, "Propagating zombie events");
        for (delivered, event) in pending.into_iter().enumerate() {
            if let Err(e) = event.replay(service).await {
                let lost = (total - delivered) as u64;
                self.dropped.inc_by(lost);
                error!(error = %e, delivered, lost, "Zombie event propagation failed");
                return Err(e);
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl RemoteCacheService for ZombieService {
    async fn update(&self, entry: CacheEntry, requester_id: ListenerId) -> Result<()> {
        self.record(ZombieEvent::Put {
            entry,
            requester_id,
        })
    }

    async fn get(&self, _region: &str, _key: &str, _requester_id: ListenerId)
        -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    async fn get_matching(
        &self,
        _region: &str,
        _pattern: &str,
        _requester_id: ListenerId,
    ) -> Result<HashMap<String, CacheEntry>> {
        Ok(HashMap::new())
    }

    async fn get_multiple(
        &self,
        _region: &str,
        _keys: &HashSet<String>,
        _requester_id: ListenerId,
    ) -> Result<HashMap<String, CacheEntry>> {
        Ok(HashMap::new())
    }

    async fn get_key_set(&self, _region: &str) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn remove(&self, region: &str, key: &str, requester_id: ListenerId) -> Result<bool> {
        self.record(ZombieEvent::Remove {
            region: region.to_string(),
            key: key.to_string(),
            requester_id,
        })?;
        Ok(false)
    }

    async fn remove_all(&self, region: &str, requester_id: ListenerId) -> Result<()> {
        self.record(ZombieEvent::RemoveAll {
            region: region.to_string(),
            requester_id,
        })
    }

    async fn dispose(&self, region: &str) -> Result<()> {
        self.record(ZombieEvent::Dispose {
            region: region.to_string(),
        })
    }
}

/// Listener registration on one endpoint: live, or a zombie placeholder.
#[derive(Clone)]
pub enum ObserverHandle {
    Live(Arc<dyn RemoteCacheObserver>),
    Zombie(Arc<ZombieObserver>),
}

impl ObserverHandle {
    /// A fresh zombie observer.
    pub fn zombie() -> Self {
        ObserverHandle::Zombie(Arc::new(ZombieObserver::new()))
    }

    /// Check if this is a zombie placeholder.
    pub fn is_zombie(&self) -> bool {
        matches!(self, ObserverHandle::Zombie(_))
    }

    /// The handle as an observer to call.
    pub fn observer(&self) -> Arc<dyn RemoteCacheObserver> {
        match self {
            ObserverHandle::Live(observer) => observer.clone(),
            ObserverHandle::Zombie(zombie) => zombie.clone(),
        }
    }
}

/// Disconnected stand-in for a `RemoteCacheObserver`.
///
/// Registrations are remembered per region and listener so they can be made
/// for real once the endpoint is reachable.
pub struct ZombieObserver {
    listeners: Mutex<HashMap<String, Vec<Arc<dyn CacheEventListener>>>>,
}

impl ZombieObserver {
    /// Create an empty observer.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Number of remembered registrations.
    pub fn pending_registrations(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }

    /// Register every remembered listener with `live`.
    ///
    /// Each listener receives the id the live observer assigns. A failure is
    /// logged and does not stop the others. Returns how many were registered.
    pub async fn repair(&self, live: &dyn RemoteCacheObserver) -> usize {
        let pending: Vec<(String, Arc<dyn CacheEventListener>)> = self
            .listeners
            .lock()
            .drain()
            .flat_map(|(region, listeners)| listeners.into_iter().map(move |l| (region.clone(), l)))
            .collect();

        let mut registered = 0;
        for (region, listener) in pending {
            match live.add_cache_listener(&region, listener.clone()).await {
                Ok(id) => {
                    listener.set_listener_id(id);
                    registered += 1;
                    debug!(region = %region, listener_id = id, "Re-registered listener");
                }
                Err(e) => {
                    warn!(region = %region, error = %e, "Failed to re-register listener");
                }
            }
        }
        registered
    }
}

impl Default for ZombieObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCacheObserver for ZombieObserver {
    async fn add_cache_listener(
        &self,
        region: &str,
        listener: Arc<dyn CacheEventListener>,
    ) -> Result<ListenerId> {
        let current = listener.listener_id();
        self.listeners
            .lock()
            .entry(region.to_string())
            .or_default()
            .push(listener);
        Ok(current)
    }

    async fn remove_cache_listener(&self, region: &str, listener_id: ListenerId) -> Result<()> {
        let mut listeners = self.listeners.lock();
        if let Some(registered) = listeners.get_mut(region) {
            registered.retain(|l| l.listener_id() != listener_id);
            if registered.is_empty() {
                listeners.remove(region);
            }
        }
        Ok(())
    }
}
