//! Collaborator seams: the remote service, its observer, endpoint resolution
//! and the local cache that receives inbound notifications.
//!
//! ```text
//!   RemoteCacheClient ──► RemoteCacheService   (get/update/remove, per region)
//!   ConnectionRegistry ─► RemoteCacheObserver  (listener registration)
//!   ConnectionRegistry ─► ConnectionResolver   (host:port + service name → handles)
//!   RemoteCacheListener ► LocalCache           (inbound put/remove/remove-all)
//! ```

use crate::error::Result;
use crate::types::{CacheEntry, ListenerId, Location};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Operations of one remote cache endpoint, scoped by region name.
///
/// `requester_id` is the caller's listener id so the server can skip echoing
/// an event back to the listener that caused it.
#[async_trait]
pub trait RemoteCacheService: Send + Sync + 'static {
    /// Store an entry in its region.
    async fn update(&self, entry: CacheEntry, requester_id: ListenerId) -> Result<()>;

    /// Fetch one entry.
    async fn get(&self, region: &str, key: &str, requester_id: ListenerId)
        -> Result<Option<CacheEntry>>;

    /// Fetch every entry whose key matches `pattern`.
    async fn get_matching(
        &self,
        region: &str,
        pattern: &str,
        requester_id: ListenerId,
    ) -> Result<HashMap<String, CacheEntry>>;

    /// Fetch several entries at once.
    async fn get_multiple(
        &self,
        region: &str,
        keys: &HashSet<String>,
        requester_id: ListenerId,
    ) -> Result<HashMap<String, CacheEntry>>;

    /// All keys stored in a region.
    async fn get_key_set(&self, region: &str) -> Result<HashSet<String>>;

    /// Remove one entry. Returns whether the server had it.
    async fn remove(&self, region: &str, key: &str, requester_id: ListenerId) -> Result<bool>;

    /// Remove every entry in a region.
    async fn remove_all(&self, region: &str, requester_id: ListenerId) -> Result<()>;

    /// Release the server-side resources held for a region.
    async fn dispose(&self, region: &str) -> Result<()>;
}

/// Receiver of notifications pushed by the remote server.
pub trait CacheEventListener: Send + Sync + 'static {
    /// An entry was stored remotely.
    fn handle_put(&self, entry: CacheEntry) -> Result<()>;

    /// An entry was removed remotely.
    fn handle_remove(&self, region: &str, key: &str) -> Result<()>;

    /// A region was cleared remotely.
    fn handle_remove_all(&self, region: &str) -> Result<()>;

    /// The server is disposing the region.
    fn handle_dispose(&self, region: &str) -> Result<()>;

    /// Id assigned by the server, `0` when unregistered.
    fn listener_id(&self) -> ListenerId;

    /// Store the id assigned by the server.
    fn set_listener_id(&self, id: ListenerId);
}

/// Listener registration on a remote endpoint.
#[async_trait]
pub trait RemoteCacheObserver: Send + Sync + 'static {
    /// Register a listener for a region and return the id the server assigned.
    async fn add_cache_listener(
        &self,
        region: &str,
        listener: Arc<dyn CacheEventListener>,
    ) -> Result<ListenerId>;

    /// Deregister a listener.
    async fn remove_cache_listener(&self, region: &str, listener_id: ListenerId) -> Result<()>;
}

/// Live handles for one endpoint.
#[derive(Clone)]
pub struct ResolvedConnection {
    /// Cache operations.
    pub service: Arc<dyn RemoteCacheService>,
    /// Listener registration.
    pub observer: Arc<dyn RemoteCacheObserver>,
}

impl std::fmt::Debug for ResolvedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConnection").finish_non_exhaustive()
    }
}

/// Turns an endpoint address into live handles.
#[async_trait]
pub trait ConnectionResolver: Send + Sync + 'static {
    /// Resolve `service_name` at `location`. Fails with `Error::Connect` when unreachable.
    async fn resolve(&self, location: &Location, service_name: &str) -> Result<ResolvedConnection>;
}

/// The in-process cache that owns the canonical data for a region.
pub trait LocalCache: Send + Sync + 'static {
    /// Apply a remote put.
    fn local_update(&self, entry: CacheEntry) -> Result<()>;

    /// Apply a remote remove.
    fn local_remove(&self, key: &str) -> Result<bool>;

    /// Apply a remote remove-all.
    fn local_remove_all(&self) -> Result<()>;
}
