//! Non-blocking front of a `RemoteCacheClient`.
//!
//! Reads go straight to the client. Writes are queued on an
//! `AsyncDeliveryQueue` so the caller never waits on the network.

use crate::client::{RemoteCacheClient, ServiceHandle};
use crate::error::Result;
use crate::metrics::{NoWaitMetrics, NoWaitMetricsSnapshot};
use crate::nowait::queue::{AsyncDeliveryQueue, QueueConfig, QueueStats};
use crate::types::{CacheEntry, CacheStatus};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Point-in-time view of a wrapper.
#[derive(Debug, Clone)]
pub struct NoWaitStats {
    pub region: String,
    pub status: CacheStatus,
    pub client_errors: u64,
    pub operations: NoWaitMetricsSnapshot,
    pub queue: QueueStats,
}

/// A client plus the queue that feeds it.
pub struct NoWaitWrapper {
    client: Arc<RemoteCacheClient>,
    queue: RwLock<Arc<AsyncDeliveryQueue>>,
    disposed: AtomicBool,
    metrics: NoWaitMetrics,
}

impl NoWaitWrapper {
    /// Wrap `client` and start its delivery queue.
    pub fn new(client: Arc<RemoteCacheClient>) -> Self {
        let queue = Self::start_queue(&client);
        Self {
            client,
            queue: RwLock::new(queue),
            disposed: AtomicBool::new(false),
            metrics: NoWaitMetrics::new(),
        }
    }

    fn start_queue(client: &Arc<RemoteCacheClient>) -> Arc<AsyncDeliveryQueue> {
        Arc::new(AsyncDeliveryQueue::new(
            client.clone(),
            client.listener_id(),
            client.region().to_string(),
            QueueConfig::from_attributes(client.attributes()),
        ))
    }

    /// Whether a dispose was queued.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Region name.
    pub fn region(&self) -> &str {
        self.client.region()
    }

    /// The wrapped client.
    pub fn client(&self) -> &Arc<RemoteCacheClient> {
        &self.client
    }

    /// The current delivery queue.
    pub fn queue(&self) -> Arc<AsyncDeliveryQueue> {
        self.queue.read().clone()
    }

    /// `Error` when the queue is dead, otherwise the client's status.
    pub fn status(&self) -> CacheStatus {
        if !self.queue.read().is_working() {
            CacheStatus::Error
        } else {
            self.client.status()
        }
    }

    pub fn stats(&self) -> NoWaitStats {
        NoWaitStats {
            region: self.region().to_string(),
            status: self.status(),
            client_errors: self.client.error_count(),
            operations: self.metrics.snapshot(),
            queue: self.queue().stats(),
        }
    }

    /// Synchronous read. An unmarshal failure is retried once.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.metrics.gets.inc();
        match self.client.get(key).await {
            Err(e) if e.is_unmarshal() => {
                self.metrics.unmarshal_retries.inc();
                debug!(region = %self.region(), key, error = %e, "Retrying get after unmarshal failure");
                self.client.get(key).await
            }
            other => other,
        }
    }

    /// Pattern read. An unmarshal failure is retried once.
    pub async fn get_matching(&self, pattern: &str) -> Result<HashMap<String, Option<CacheEntry>>> {
        self.metrics.get_matchings.inc();
        match self.client.get_matching(pattern).await {
            Err(e) if e.is_unmarshal() => {
                self.metrics.unmarshal_retries.inc();
                debug!(region = %self.region(), pattern, error = %e, "Retrying get_matching after unmarshal failure");
                self.client.get_matching(pattern).await
            }
            other => other,
        }
    }

    /// Multi-key read. An unmarshal failure is retried once.
    pub async fn get_multiple(
        &self,
        keys: &HashSet<String>,
    ) -> Result<HashMap<String, Option<CacheEntry>>> {
        self.metrics.get_multiples.inc();
        match self.client.get_multiple(keys).await {
            Err(e) if e.is_unmarshal() => {
                self.metrics.unmarshal_retries.inc();
                debug!(region = %self.region(), error = %e, "Retrying get_multiple after unmarshal failure");
                self.client.get_multiple(keys).await
            }
            other => other,
        }
    }

    pub async fn get_key_set(&self) -> Result<HashSet<String>> {
        self.client.get_key_set().await
    }

    /// Queue an update.
    pub fn update(&self, entry: impl Into<CacheEntry>) -> Result<()> {
        self.metrics.updates.inc();
        self.enqueue(|q| q.add_put_event(entry.into()))
    }

    /// Queue a remove.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.metrics.removes.inc();
        self.enqueue(|q| q.add_remove_event(key))
    }

    /// Queue a remove-all.
    pub fn remove_all(&self) -> Result<()> {
        self.metrics.remove_alls.inc();
        self.enqueue(|q| q.add_remove_all_event())
    }

    /// Queue a dispose. Only the first call queues one.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!(region = %self.region(), "Dispose already queued");
            return Ok(());
        }
        self.metrics.disposes.inc();
        self.enqueue(|q| q.add_dispose_event())
    }

    fn enqueue(&self, add: impl FnOnce(&AsyncDeliveryQueue) -> Result<()>) -> Result<()> {
        let queue = self.queue();
        add(&queue).map_err(|e| {
            error!(region = %self.region(), error = %e, "Could not queue event");
            queue.destroy();
            e
        })
    }

    /// Install a fresh handle on the client and replace the delivery queue.
    ///
    /// The old queue finishes its backlog against the fixed client and stops;
    /// the new queue starts delivering only after that.
    pub async fn fix_cache(&self, handle: ServiceHandle) {
        self.client.fix_cache(handle).await;

        let mut slot = self.queue.write();
        let fresh = Arc::new(AsyncDeliveryQueue::following(
            &slot,
            self.client.clone(),
            self.client.listener_id(),
            self.client.region().to_string(),
            QueueConfig::from_attributes(self.client.attributes()),
        ));
        let previous = std::mem::replace(&mut *slot, fresh);
        drop(slot);
        if previous.is_working() {
            previous.close_after_drain();
        } else {
            previous.destroy();
        }
        info!(region = %self.region(), listener_id = self.client.listener_id(), "Delivery queue replaced");
    }
}

impl std::fmt::Debug for NoWaitWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoWaitWrapper")
            .field("region", &self.region())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteCacheListener;
    use crate::config::RemoteCacheAttributes;
    use crate::failover::MonitorSignal;
    use crate::nowait::FacadeDirectory;
    use crate::testing::mocks::{wait_until, MockRemoteService, RecordingLocalCache};
    use crate::types::{CacheElement, Location};

    fn wrapper(attrs: RemoteCacheAttributes) -> (NoWaitWrapper, Arc<MockRemoteService>) {
        let service = Arc::new(MockRemoteService::new("primary"));
        (wrapper_on(attrs, ServiceHandle::Live(service.clone())), service)
    }

    fn wrapper_on(attrs: RemoteCacheAttributes, handle: ServiceHandle) -> NoWaitWrapper {
        let listener = Arc::new(RemoteCacheListener::new(
            &attrs,
            Arc::new(RecordingLocalCache::new()),
        ));
        let client = Arc::new(RemoteCacheClient::new(
            attrs,
            handle,
            listener,
            Arc::new(MonitorSignal::new()),
            Arc::new(FacadeDirectory::new()),
        ));
        NoWaitWrapper::new(client)
    }

    fn attrs() -> RemoteCacheAttributes {
        RemoteCacheAttributes::new("users", Location::new("primary", 1102))
    }

    fn element(key: &str) -> CacheElement {
        CacheElement::new("users", key, "v")
    }

    #[tokio::test]
    async fn test_writes_are_delivered_in_order() {
        let (w, service) = wrapper(attrs());
        w.update(element("a")).unwrap();
        w.update(element("b")).unwrap();
        w.remove("a").unwrap();
        w.remove_all().unwrap();

        wait_until(|| service.call_count() == 4).await;
        assert_eq!(
            service.calls(),
            vec!["update:users:a", "update:users:b", "remove:users:a", "remove_all:users"]
        );
        let operations = w.stats().operations;
        assert_eq!(operations.updates, 2);
        assert_eq!(operations.removes, 1);
        assert_eq!(operations.remove_alls, 1);
    }

    #[tokio::test]
    async fn test_dispose_is_queued_once() {
        let (w, service) = wrapper(attrs());
        w.dispose().unwrap();
        w.dispose().unwrap();

        wait_until(|| !w.queue().is_working()).await;
        assert!(w.is_disposed());
        assert_eq!(service.calls(), vec!["dispose:users"]);
        assert_eq!(w.queue().stats().enqueued, 1);
        assert_eq!(w.stats().operations.disposes, 1);
    }

    #[tokio::test]
    async fn test_get_retries_unmarshal_once() {
        let (w, service) = wrapper(attrs());
        service.fail_gets_with_unmarshal(1);
        service.seed(element("a").into());

        let entry = w.get("a").await.unwrap();
        assert!(entry.is_some());
        assert_eq!(w.stats().operations.unmarshal_retries, 1);
        assert_eq!(w.status(), CacheStatus::Alive);
    }

    #[tokio::test]
    async fn test_second_unmarshal_failure_is_returned() {
        let (w, service) = wrapper(attrs());
        service.fail_gets_with_unmarshal(2);

        let err = w.get("a").await.unwrap_err();
        assert!(err.is_unmarshal());
    }

    #[tokio::test]
    async fn test_dead_queue_reports_error() {
        let (w, _) = wrapper(attrs());
        w.queue().destroy();

        assert_eq!(w.status(), CacheStatus::Error);
        assert!(w.update(element("a")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fix_cache_restores_failed_wrapper() {
        let (w, service) =
            wrapper(attrs().with_event_retry(3, std::time::Duration::from_millis(10)));
        service.set_failing(true);

        // The failed put is retried and lands in the zombie.
        w.update(element("lost")).unwrap();
        w.update(element("a")).unwrap();
        w.remove("a").unwrap();
        wait_until(|| w.queue().stats().processed == 3).await;
        assert_eq!(w.status(), CacheStatus::Error);

        let restored = Arc::new(MockRemoteService::new("restored"));
        w.fix_cache(ServiceHandle::Live(restored.clone())).await;
        assert_eq!(w.status(), CacheStatus::Alive);
        assert_eq!(
            restored.calls(),
            vec!["update:users:lost", "update:users:a", "remove:users:a"]
        );

        w.update(element("b")).unwrap();
        wait_until(|| restored.call_count() == 4).await;
        assert_eq!(restored.calls()[3], "update:users:b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_during_fix_follow_buffered_events() {
        let attrs = attrs();
        let zombie = ServiceHandle::zombie(attrs.zombie_queue_max_size, attrs.zombie_overflow_policy);
        let w = Arc::new(wrapper_on(attrs, zombie));
        w.update(element("a1")).unwrap();
        w.update(element("a2")).unwrap();
        wait_until(|| w.queue().stats().processed == 2).await;

        let slow = Arc::new(MockRemoteService::new("slow"));
        slow.set_update_delay(std::time::Duration::from_millis(50));
        let fixing = tokio::spawn({
            let w = w.clone();
            let slow = slow.clone();
            async move { w.fix_cache(ServiceHandle::Live(slow)).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        w.update(element("b")).unwrap();
        fixing.await.unwrap();
        w.update(element("c")).unwrap();

        wait_until(|| slow.call_count() == 4).await;
        assert_eq!(
            slow.calls(),
            vec!["update:users:a1", "update:users:a2", "update:users:b", "update:users:c"]
        );
    }
}
