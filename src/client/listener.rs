//! Inbound side of a remote region: notifications pushed by the server are
//! applied to the local cache.

use crate::config::RemoteCacheAttributes;
use crate::error::Result;
use crate::service::{CacheEventListener, LocalCache};
use crate::types::{CacheEntry, ListenerId, RemoteType, LISTENER_UNREGISTERED};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Listener registered with a remote server for one region.
pub struct RemoteCacheListener {
    region: String,
    remote_type: RemoteType,
    remove_upon_remote_put: bool,
    local_cluster_consistency: bool,
    listener_id: AtomicI64,
    disposed: AtomicBool,
    local: Arc<dyn LocalCache>,
}

impl RemoteCacheListener {
    /// Create an unregistered listener feeding `local`.
    pub fn new(attributes: &RemoteCacheAttributes, local: Arc<dyn LocalCache>) -> Self {
        Self {
            region: attributes.region.clone(),
            remote_type: attributes.remote_type,
            remove_upon_remote_put: attributes.remove_upon_remote_put,
            local_cluster_consistency: attributes.local_cluster_consistency,
            listener_id: AtomicI64::new(LISTENER_UNREGISTERED),
            disposed: AtomicBool::new(false),
            local,
        }
    }

    /// Region this listener serves.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Ask the server for a new id on the next registration.
    pub fn reset_listener_id(&self) {
        self.listener_id.store(LISTENER_UNREGISTERED, Ordering::SeqCst);
    }

    /// Stop applying notifications.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Check if the listener was disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RemoteCacheListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCacheListener")
            .field("region", &self.region)
            .field("remote_type", &self.remote_type)
            .field("listener_id", &self.listener_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl CacheEventListener for RemoteCacheListener {
    fn handle_put(&self, entry: CacheEntry) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }

        if self.remove_upon_remote_put {
            debug!(region = %self.region, key = entry.key(), "Remote put, removing local copy");
            self.local.local_remove(entry.key())?;
            return Ok(());
        }

        // Cluster peers keep entries encoded unless the local cache must see plain values.
        let unwrap = self.remote_type == RemoteType::Local || self.local_cluster_consistency;
        let entry = match entry {
            CacheEntry::Serialized(serialized) if unwrap => CacheEntry::Raw(serialized.to_element()?),
            entry => entry,
        };
        trace!(region = %self.region, key = entry.key(), "Applying remote put");
        self.local.local_update(entry)
    }

    fn handle_remove(&self, region: &str, key: &str) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        trace!(region, key, "Applying remote remove");
        self.local.local_remove(key).map(|_| ())
    }

    fn handle_remove_all(&self, region: &str) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        debug!(region, "Applying remote remove-all");
        self.local.local_remove_all()
    }

    fn handle_dispose(&self, region: &str) -> Result<()> {
        debug!(region, "Remote region disposed");
        self.dispose();
        Ok(())
    }

    fn listener_id(&self) -> ListenerId {
        self.listener_id.load(Ordering::SeqCst)
    }

    fn set_listener_id(&self, id: ListenerId) {
        self.listener_id.store(id, Ordering::SeqCst);
    }
}
