//! Remote cache client for one region.
//!
//! The client turns cache operations into calls on a `ServiceHandle` and owns
//! the reaction to failures: the handle is swapped for a zombie, the health
//! monitor is woken and, for local-role regions, the facade starts failover.
//!
//! ```text
//!   get / update / remove ──► ServiceHandle::Live ──► RemoteCacheService
//!            │                       │ error
//!            │                       ▼
//!            │               handle_exception
//!            │          ┌────────────┼──────────────┐
//!            │          ▼            ▼              ▼
//!            │   swap to Zombie   wake monitor   facade.failover(0)
//!            ▼
//!   ServiceHandle::Zombie ──► buffered until fix_cache replays it
//! ```

pub mod listener;
pub mod pool;
pub mod zombie;

pub use listener::RemoteCacheListener;
pub use pool::GetPool;
pub use zombie::{ObserverHandle, ServiceHandle, ZombieEvent, ZombieObserver, ZombieService};

use crate::config::RemoteCacheAttributes;
use crate::error::{Error, Result};
use crate::failover::MonitorSignal;
use crate::metrics::Counter;
use crate::nowait::{CacheEventHandler, FacadeDirectory};
use crate::service::{CacheEventListener, RemoteCacheService};
use crate::types::{CacheEntry, CacheStatus, ListenerId, RemoteType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Client side of one remote region over one endpoint.
pub struct RemoteCacheClient {
    attributes: RemoteCacheAttributes,
    handle: RwLock<ServiceHandle>,
    // Held for writing while buffered events are replayed; remote calls wait on it.
    replay_gate: tokio::sync::RwLock<()>,
    listener: Arc<RemoteCacheListener>,
    signal: Arc<MonitorSignal>,
    facades: Arc<FacadeDirectory>,
    get_pool: Option<GetPool>,
    errors: Counter,
}

impl RemoteCacheClient {
    /// Create a client over `handle`.
    ///
    /// A timed-get pool is created when the attributes enable a get timeout.
    pub fn new(
        attributes: RemoteCacheAttributes,
        handle: ServiceHandle,
        listener: Arc<RemoteCacheListener>,
        signal: Arc<MonitorSignal>,
        facades: Arc<FacadeDirectory>,
    ) -> Self {
        let get_pool = attributes
            .get_timeout()
            .map(|_| GetPool::new(attributes.thread_pool_name.clone(), attributes.get_pool_size));

        Self {
            attributes,
            handle: RwLock::new(handle),
            replay_gate: tokio::sync::RwLock::new(()),
            listener,
            signal,
            facades,
            get_pool,
            errors: Counter::new("client_errors", "Remote calls that failed"),
        }
    }

    /// Region name.
    pub fn region(&self) -> &str {
        &self.attributes.region
    }

    /// Region configuration.
    pub fn attributes(&self) -> &RemoteCacheAttributes {
        &self.attributes
    }

    /// Role of this client.
    pub fn remote_type(&self) -> RemoteType {
        self.attributes.remote_type
    }

    /// The listener receiving this region's notifications.
    pub fn listener(&self) -> &Arc<RemoteCacheListener> {
        &self.listener
    }

    /// Id the server assigned to this region's listener.
    pub fn listener_id(&self) -> ListenerId {
        self.listener.listener_id()
    }

    /// Current handle.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.read().clone()
    }

    /// Number of failed remote calls.
    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    /// `Alive` unless the handle is a zombie.
    pub fn status(&self) -> CacheStatus {
        if self.handle.read().is_zombie() {
            CacheStatus::Error
        } else {
            CacheStatus::Alive
        }
    }

    fn service(&self) -> Arc<dyn RemoteCacheService> {
        self.handle.read().service()
    }

    /// Local-role clients hand out plain elements; cluster clients pass entries through.
    fn unwrap_entry(&self, entry: CacheEntry) -> Result<CacheEntry> {
        match (self.attributes.remote_type, entry) {
            (RemoteType::Local, CacheEntry::Serialized(serialized)) => {
                Ok(CacheEntry::Raw(serialized.to_element()?))
            }
            (_, entry) => Ok(entry),
        }
    }

    fn unwrap_batch(&self, batch: HashMap<String, CacheEntry>) -> HashMap<String, Option<CacheEntry>> {
        batch
            .into_iter()
            .map(|(key, entry)| match self.unwrap_entry(entry) {
                Ok(entry) => (key, Some(entry)),
                Err(e) => {
                    warn!(region = %self.attributes.region, key = %key, error = %e, "Could not unwrap entry");
                    (key, None)
                }
            })
            .collect()
    }

    /// Fetch one entry.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let _replayed = self.replay_gate.read().await;
        let result = match (&self.get_pool, self.attributes.get_timeout()) {
            (Some(pool), Some(timeout)) => {
                let service = self.service();
                let region = self.attributes.region.clone();
                let owned_key = key.to_string();
                let requester = self.listener_id();
                pool.execute(
                    async move { service.get(&region, &owned_key, requester).await },
                    timeout,
                )
                .await
                .map_err(|e| match e {
                    Error::Timeout => {
                        Error::RemoteIo(format!("get request timed out after {:?}", timeout))
                    }
                    other => other,
                })
            }
            _ => {
                self.service()
                    .get(&self.attributes.region, key, self.listener_id())
                    .await
            }
        };

        result
            .map_err(|e| self.handle_exception(e, "get", Some(key)))?
            .map(|entry| self.unwrap_entry(entry))
            .transpose()
    }

    /// Fetch every entry whose key matches `pattern`. Entries that fail to decode map to `None`.
    pub async fn get_matching(&self, pattern: &str) -> Result<HashMap<String, Option<CacheEntry>>> {
        let _replayed = self.replay_gate.read().await;
        match self
            .service()
            .get_matching(&self.attributes.region, pattern, self.listener_id())
            .await
        {
            Ok(batch) => Ok(self.unwrap_batch(batch)),
            Err(e) => Err(self.handle_exception(e, "get_matching", Some(pattern))),
        }
    }

    /// Fetch several entries. Entries that fail to decode map to `None`.
    pub async fn get_multiple(
        &self,
        keys: &HashSet<String>,
    ) -> Result<HashMap<String, Option<CacheEntry>>> {
        let _replayed = self.replay_gate.read().await;
        match self
            .service()
            .get_multiple(&self.attributes.region, keys, self.listener_id())
            .await
        {
            Ok(batch) => Ok(self.unwrap_batch(batch)),
            Err(e) => Err(self.handle_exception(e, "get_multiple", None)),
        }
    }

    /// All keys in the region.
    pub async fn get_key_set(&self) -> Result<HashSet<String>> {
        let _replayed = self.replay_gate.read().await;
        self.service()
            .get_key_set(&self.attributes.region)
            .await
            .map_err(|e| self.handle_exception(e, "get_key_set", None))
    }

    /// Remove one entry remotely.
    ///
    /// Returns `false` only in get-only mode; otherwise `true` whether or not
    /// the server had the key.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        if self.attributes.get_only {
            debug!(region = %self.attributes.region, key, "Get-only, skipping remove");
            return Ok(false);
        }
        let _replayed = self.replay_gate.read().await;
        self.service()
            .remove(&self.attributes.region, key, self.listener_id())
            .await
            .map(|_| true)
            .map_err(|e| self.handle_exception(e, "remove", Some(key)))
    }

    /// Remove every entry in the region remotely.
    pub async fn remove_all(&self) -> Result<()> {
        if self.attributes.get_only {
            debug!(region = %self.attributes.region, "Get-only, skipping remove_all");
            return Ok(());
        }
        let _replayed = self.replay_gate.read().await;
        self.service()
            .remove_all(&self.attributes.region, self.listener_id())
            .await
            .map_err(|e| self.handle_exception(e, "remove_all", None))
    }

    /// Store an entry remotely in its transport-neutral form.
    pub async fn update(&self, entry: CacheEntry) -> Result<()> {
        if self.attributes.get_only {
            debug!(region = %self.attributes.region, key = entry.key(), "Get-only, skipping update");
            return Ok(());
        }

        let serialized = match entry.into_serialized() {
            Ok(serialized) => serialized,
            Err(Error::MissingAttributes { key }) => {
                warn!(region = %self.attributes.region, key = %key, "Element has no attributes, not sent");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let key = serialized.key.clone();
        let _replayed = self.replay_gate.read().await;
        self.service()
            .update(CacheEntry::Serialized(serialized), self.listener_id())
            .await
            .map_err(|e| self.handle_exception(e, "update", Some(&key)))
    }

    /// Release the region on the server and stop the listener.
    pub async fn dispose(&self) -> Result<()> {
        info!(region = %self.attributes.region, "Disposing remote cache client");
        let _replayed = self.replay_gate.read().await;
        let result = self
            .service()
            .dispose(&self.attributes.region)
            .await
            .map_err(|e| self.handle_exception(e, "dispose", None));
        self.listener.dispose();
        result
    }

    /// Install a freshly resolved handle.
    ///
    /// If the previous handle was a zombie its buffered events are replayed
    /// against the new one in order. Calls made meanwhile wait until the
    /// replay is over. A replay failure is reported but the new handle stays
    /// in place.
    pub async fn fix_cache(&self, restored: ServiceHandle) {
        let _replaying = self.replay_gate.write().await;
        let previous = std::mem::replace(&mut *self.handle.write(), restored.clone());

        if let (ServiceHandle::Zombie(zombie), ServiceHandle::Live(live)) = (&previous, &restored) {
            match zombie.propagate_events(live.as_ref()).await {
                Ok(count) => {
                    info!(region = %self.attributes.region, replayed = count, "Remote cache fixed");
                }
                Err(e) => {
                    self.errors.inc();
                    error!(region = %self.attributes.region, error = %e, "Replaying buffered events failed");
                    self.signal.notify_error();
                }
            }
        }
    }

    /// React to a failed remote call and return the error to raise.
    ///
    /// Safe to call repeatedly: an existing zombie is left in place.
    fn handle_exception(&self, err: Error, operation: &str, key: Option<&str>) -> Error {
        self.errors.inc();
        if err.is_unmarshal() {
            // A payload that cannot be decoded says nothing about the connection.
            warn!(region = %self.attributes.region, operation, key = ?key, error = %err, "Remote reply could not be decoded");
            return err;
        }
        error!(
            region = %self.attributes.region,
            operation,
            key = ?key,
            error = %err,
            "Remote cache call failed"
        );

        {
            let mut handle = self.handle.write();
            if !handle.is_zombie() {
                warn!(region = %self.attributes.region, "Switching to zombie handle");
                *handle = ServiceHandle::zombie(
                    self.attributes.zombie_queue_max_size,
                    self.attributes.zombie_overflow_policy,
                );
            }
        }

        self.signal.notify_error();

        if self.attributes.remote_type == RemoteType::Local {
            if let Some(facade) = self.facades.get(&self.attributes.region) {
                facade.failover(0);
            }
        }

        err.into_io(operation)
    }
}

impl std::fmt::Debug for RemoteCacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCacheClient")
            .field("region", &self.attributes.region)
            .field("remote_type", &self.attributes.remote_type)
            .field("handle", &*self.handle.read())
            .field("listener_id", &self.listener_id())
            .finish()
    }
}

#[async_trait]
impl CacheEventHandler for RemoteCacheClient {
    async fn handle_put(&self, entry: CacheEntry) -> Result<()> {
        self.update(entry).await
    }

    async fn handle_remove(&self, key: &str) -> Result<()> {
        self.remove(key).await.map(|_| ())
    }

    async fn handle_remove_all(&self) -> Result<()> {
        self.remove_all().await
    }

    async fn handle_dispose(&self) -> Result<()> {
        self.dispose().await
    }
}
