//! Asynchronous, ordered delivery of region mutations.
//!
//! Callers enqueue without waiting; a single consumer task per queue delivers
//! events in submission order to a `CacheEventHandler`. A failed delivery is
//! retried a bounded number of times and then dropped, the consumer moves on.
//! Admission fails only when the queue is gone or full, and that tears it down.

use crate::config::RemoteCacheAttributes;
use crate::error::{Error, Result};
use crate::metrics::QueueMetrics;
use crate::types::{CacheEntry, ListenerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Target of delivered events.
#[async_trait]
pub trait CacheEventHandler: Send + Sync + 'static {
    async fn handle_put(&self, entry: CacheEntry) -> Result<()>;
    async fn handle_remove(&self, key: &str) -> Result<()>;
    async fn handle_remove_all(&self) -> Result<()>;
    async fn handle_dispose(&self) -> Result<()>;
}

/// A queued mutation.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Put(CacheEntry),
    Remove(String),
    RemoveAll,
    Dispose,
}

impl CacheEvent {
    fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Put(_) => "put",
            CacheEvent::Remove(_) => "remove",
            CacheEvent::RemoveAll => "remove_all",
            CacheEvent::Dispose => "dispose",
        }
    }

    async fn deliver(&self, handler: &dyn CacheEventHandler) -> Result<()> {
        match self {
            CacheEvent::Put(entry) => handler.handle_put(entry.clone()).await,
            CacheEvent::Remove(key) => handler.handle_remove(key).await,
            CacheEvent::RemoveAll => handler.handle_remove_all().await,
            CacheEvent::Dispose => handler.handle_dispose().await,
        }
    }
}

/// Delivery queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Events the queue holds before refusing more.
    pub capacity: usize,
    /// Retries of a failed delivery before it is dropped.
    pub max_failure: usize,
    /// Pause between retries.
    pub wait_before_retry: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_failure: 3,
            wait_before_retry: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    /// Settings taken from region attributes.
    pub fn from_attributes(attributes: &RemoteCacheAttributes) -> Self {
        Self {
            capacity: attributes.event_queue_capacity.max(1),
            max_failure: attributes.event_max_failure,
            wait_before_retry: attributes.event_wait_before_retry,
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub region: String,
    pub listener_id: ListenerId,
    pub working: bool,
    pub pending: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Ordered, single-consumer delivery queue for one region.
pub struct AsyncDeliveryQueue {
    region: String,
    listener_id: ListenerId,
    sender: Mutex<Option<mpsc::Sender<CacheEvent>>>,
    working: Arc<AtomicBool>,
    cancel: CancellationToken,
    finished: CancellationToken,
    metrics: Arc<QueueMetrics>,
}

impl AsyncDeliveryQueue {
    /// Create the queue and spawn its consumer. Must be called inside a tokio runtime.
    pub fn new(
        handler: Arc<dyn CacheEventHandler>,
        listener_id: ListenerId,
        region: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self::start(handler, listener_id, region.into(), config, None)
    }

    /// Create a queue whose consumer starts only once `previous` has stopped.
    ///
    /// Events accepted meanwhile are held, so nothing overtakes the
    /// predecessor's backlog.
    pub fn following(
        previous: &AsyncDeliveryQueue,
        handler: Arc<dyn CacheEventHandler>,
        listener_id: ListenerId,
        region: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self::start(
            handler,
            listener_id,
            region.into(),
            config,
            Some(previous.finished.clone()),
        )
    }

    fn start(
        handler: Arc<dyn CacheEventHandler>,
        listener_id: ListenerId,
        region: String,
        config: QueueConfig,
        predecessor: Option<CancellationToken>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let working = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let metrics = Arc::new(QueueMetrics::new());

        tokio::spawn(Self::consumer_loop(
            handler,
            rx,
            config,
            region.clone(),
            working.clone(),
            cancel.clone(),
            finished.clone(),
            predecessor,
            metrics.clone(),
        ));

        debug!(region = %region, listener_id, "Delivery queue started");

        Self {
            region,
            listener_id,
            sender: Mutex::new(Some(tx)),
            working,
            cancel,
            finished,
            metrics,
        }
    }

    /// Region served by this queue.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Listener id the queue was created for.
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// Whether the consumer is still running.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Events accepted but not yet taken by the consumer.
    pub fn pending(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            region: self.region.clone(),
            listener_id: self.listener_id,
            working: self.is_working(),
            pending: self.pending(),
            enqueued: self.metrics.enqueued.get(),
            processed: self.metrics.processed.get(),
            failed: self.metrics.failed.get(),
            retries: self.metrics.retries.get(),
        }
    }

    /// Enqueue a put.
    pub fn add_put_event(&self, entry: CacheEntry) -> Result<()> {
        self.add(CacheEvent::Put(entry))
    }

    /// Enqueue a remove.
    pub fn add_remove_event(&self, key: impl Into<String>) -> Result<()> {
        self.add(CacheEvent::Remove(key.into()))
    }

    /// Enqueue a remove-all.
    pub fn add_remove_all_event(&self) -> Result<()> {
        self.add(CacheEvent::RemoveAll)
    }

    /// Enqueue a dispose. The consumer stops after delivering it.
    pub fn add_dispose_event(&self) -> Result<()> {
        self.add(CacheEvent::Dispose)
    }

    fn add(&self, event: CacheEvent) -> Result<()> {
        let kind = event.kind();
        let refused = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(_) if !self.is_working() => Some("consumer stopped"),
                Some(tx) => match tx.try_send(event) {
                    Ok(()) => None,
                    Err(TrySendError::Full(_)) => Some("queue full"),
                    Err(TrySendError::Closed(_)) => Some("queue closed"),
                },
                None => Some("queue destroyed"),
            }
        };

        match refused {
            None => {
                self.metrics.enqueued.inc();
                trace!(region = %self.region, kind, "Event queued");
                Ok(())
            }
            Some(reason) => {
                warn!(region = %self.region, kind, reason, "Delivery queue refused event");
                self.destroy();
                Err(Error::QueueAdmission {
                    region: self.region.clone(),
                    reason: reason.to_string(),
                })
            }
        }
    }

    /// Stop the consumer now. Undelivered events are discarded.
    pub fn destroy(&self) {
        if self.working.swap(false, Ordering::SeqCst) {
            info!(region = %self.region, listener_id = self.listener_id, "Destroying delivery queue");
        }
        self.sender.lock().take();
        self.cancel.cancel();
    }

    /// Refuse new events and let the consumer finish what is already queued.
    pub fn close_after_drain(&self) {
        if self.sender.lock().take().is_some() {
            debug!(region = %self.region, "Delivery queue closing after backlog");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn consumer_loop(
        handler: Arc<dyn CacheEventHandler>,
        mut rx: mpsc::Receiver<CacheEvent>,
        config: QueueConfig,
        region: String,
        working: Arc<AtomicBool>,
        cancel: CancellationToken,
        finished: CancellationToken,
        predecessor: Option<CancellationToken>,
        metrics: Arc<QueueMetrics>,
    ) {
        let released = match predecessor {
            Some(previous) => tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = previous.cancelled() => true,
            },
            None => true,
        };

        while released {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let is_dispose = matches!(event, CacheEvent::Dispose);
            Self::deliver(handler.as_ref(), &event, &config, &region, &cancel, &metrics).await;
            if is_dispose {
                debug!(region = %region, "Dispose delivered, stopping consumer");
                break;
            }
        }

        working.store(false, Ordering::SeqCst);
        finished.cancel();
        debug!(region = %region, "Delivery queue consumer stopped");
    }

    async fn deliver(
        handler: &dyn CacheEventHandler,
        event: &CacheEvent,
        config: &QueueConfig,
        region: &str,
        cancel: &CancellationToken,
        metrics: &QueueMetrics,
    ) {
        let mut attempt = 0;
        loop {
            match event.deliver(handler).await {
                Ok(()) => {
                    metrics.processed.inc();
                    return;
                }
                Err(e) if attempt < config.max_failure => {
                    attempt += 1;
                    metrics.retries.inc();
                    debug!(region, kind = event.kind(), attempt, error = %e, "Delivery failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(config.wait_before_retry) => {}
                    }
                }
                Err(e) => {
                    metrics.failed.inc();
                    error!(region, kind = event.kind(), attempts = attempt + 1, error = %e, "Dropping undeliverable event");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for AsyncDeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDeliveryQueue")
            .field("region", &self.region)
            .field("listener_id", &self.listener_id)
            .field("working", &self.is_working())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::RecordingHandler;
    use crate::types::CacheElement;

    fn queue(handler: Arc<RecordingHandler>, config: QueueConfig) -> AsyncDeliveryQueue {
        AsyncDeliveryQueue::new(handler, 3, "users", config)
    }

    fn entry(key: &str) -> CacheEntry {
        CacheElement::new("users", key, "v").into()
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let handler = Arc::new(RecordingHandler::new());
        let q = queue(handler.clone(), QueueConfig::default());

        q.add_put_event(entry("a")).unwrap();
        q.add_remove_event("a").unwrap();
        q.add_put_event(entry("b")).unwrap();
        q.add_remove_all_event().unwrap();

        handler.wait_for(4).await;
        assert_eq!(handler.events(), vec!["put:a", "remove:a", "put:b", "remove_all"]);
        assert!(q.is_working());
        assert_eq!(q.stats().processed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_event_is_retried_then_dropped() {
        let handler = Arc::new(RecordingHandler::new());
        // One first try plus two retries for "a", all failing.
        handler.fail_next(3);
        let config = QueueConfig {
            max_failure: 2,
            wait_before_retry: Duration::from_millis(50),
            ..Default::default()
        };
        let q = queue(handler.clone(), config);

        q.add_put_event(entry("a")).unwrap();
        q.add_put_event(entry("b")).unwrap();

        handler.wait_for(1).await;
        let stats = q.stats();
        assert!(q.is_working());
        assert_eq!(handler.events(), vec!["put:b"]);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_event() {
        let handler = Arc::new(RecordingHandler::new());
        handler.fail_next(1);
        let q = queue(
            handler.clone(),
            QueueConfig {
                max_failure: 1,
                wait_before_retry: Duration::from_millis(10),
                ..Default::default()
            },
        );

        q.add_put_event(entry("a")).unwrap();
        handler.wait_for(1).await;
        assert_eq!(handler.events(), vec!["put:a"]);
        assert_eq!(q.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_destroy_refuses_new_events() {
        let handler = Arc::new(RecordingHandler::new());
        let q = queue(handler.clone(), QueueConfig::default());
        q.destroy();

        assert!(!q.is_working());
        let err = q.add_put_event(entry("a")).unwrap_err();
        assert!(matches!(err, Error::QueueAdmission { ref reason, .. } if reason == "queue destroyed"));
    }

    #[tokio::test]
    async fn test_full_queue_is_torn_down() {
        let handler = Arc::new(RecordingHandler::new());
        handler.block();
        let q = queue(
            handler.clone(),
            QueueConfig {
                capacity: 2,
                ..Default::default()
            },
        );

        // One event is held by the blocked consumer, two fill the channel.
        q.add_put_event(entry("a")).unwrap();
        handler.wait_started().await;
        q.add_put_event(entry("b")).unwrap();
        q.add_put_event(entry("c")).unwrap();

        let err = q.add_put_event(entry("d")).unwrap_err();
        assert!(matches!(err, Error::QueueAdmission { .. }));
        assert!(!q.is_working());
    }

    #[tokio::test]
    async fn test_dispose_stops_consumer() {
        let handler = Arc::new(RecordingHandler::new());
        let q = queue(handler.clone(), QueueConfig::default());

        q.add_put_event(entry("a")).unwrap();
        q.add_dispose_event().unwrap();
        handler.wait_for(2).await;

        for _ in 0..10 {
            if !q.is_working() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!q.is_working());
        assert_eq!(handler.events(), vec!["put:a", "dispose"]);
    }

    #[tokio::test]
    async fn test_following_queue_waits_for_previous_backlog() {
        let handler = Arc::new(RecordingHandler::new());
        handler.block();
        let first = queue(handler.clone(), QueueConfig::default());
        first.add_put_event(entry("a")).unwrap();
        handler.wait_started().await;
        first.add_put_event(entry("b")).unwrap();

        let second = AsyncDeliveryQueue::following(&first, handler.clone(), 3, "users", QueueConfig::default());
        first.close_after_drain();
        second.add_put_event(entry("c")).unwrap();

        handler.unblock();
        handler.wait_for(3).await;
        assert_eq!(handler.events(), vec!["put:a", "put:b", "put:c"]);
        assert!(second.is_working());
    }

    #[tokio::test]
    async fn test_close_after_drain_delivers_backlog() {
        let handler = Arc::new(RecordingHandler::new());
        let q = queue(handler.clone(), QueueConfig::default());
        for key in ["a", "b", "c"] {
            q.add_put_event(entry(key)).unwrap();
        }
        q.close_after_drain();

        handler.wait_for(3).await;
        assert_eq!(handler.events(), vec!["put:a", "put:b", "put:c"]);
        assert!(q.add_put_event(entry("d")).is_err());
    }
}
