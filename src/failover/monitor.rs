//! Background repair of registries whose connections failed.

use crate::config::{MonitorConfig, MonitorMode};
use crate::failover::registry::RegistryDirectory;
use crate::metrics::Counter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error notifications from clients and registries to the monitor.
#[derive(Debug)]
pub struct MonitorSignal {
    notify: Notify,
    all_right: AtomicBool,
    errors: Counter,
}

impl MonitorSignal {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            all_right: AtomicBool::new(true),
            errors: Counter::new("monitor_error_reports", "Errors reported to the health monitor"),
        }
    }

    /// Report a failure and wake the monitor.
    pub fn notify_error(&self) {
        self.errors.inc();
        self.all_right.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// No error reported since the last repair pass began.
    pub fn is_all_right(&self) -> bool {
        self.all_right.load(Ordering::SeqCst)
    }

    /// Errors reported so far.
    pub fn error_reports(&self) -> u64 {
        self.errors.get()
    }

    fn set_all_right(&self, value: bool) {
        self.all_right.store(value, Ordering::SeqCst);
    }

    async fn wait_for_error(&self) {
        self.notify.notified().await;
    }
}

impl Default for MonitorSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Repairs every registry holding a failed region, once per wake-up.
pub struct HealthMonitor {
    config: MonitorConfig,
    directory: Arc<RegistryDirectory>,
    signal: Arc<MonitorSignal>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    passes: Counter,
    repairs: Counter,
    failed_repairs: Counter,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, directory: Arc<RegistryDirectory>) -> Arc<Self> {
        let signal = directory.signal().clone();
        Arc::new(Self {
            config,
            directory,
            signal,
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
            passes: Counter::new("monitor_passes", "Repair passes run"),
            repairs: Counter::new("monitor_repairs", "Registries reconnected"),
            failed_repairs: Counter::new("monitor_failed_repairs", "Registry reconnects that failed"),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn passes(&self) -> u64 {
        self.passes.get()
    }

    pub fn repairs(&self) -> u64 {
        self.repairs.get()
    }

    pub fn failed_repairs(&self) -> u64 {
        self.failed_repairs.get()
    }

    /// Spawn the monitor loop. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        *handle = Some(tokio::spawn(self.clone().run()));
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Returns `false` if the loop had died abnormally.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Health monitor task failed");
                    false
                }
            },
            None => true,
        }
    }

    async fn run(self: Arc<Self>) {
        let idle = self.config.effective_idle_period();
        info!(mode = ?self.config.mode, ?idle, "Health monitor started");

        loop {
            if !self.wait_for_work().await {
                break;
            }

            let all_right = self.run_pass().await;
            debug!(all_right, "Repair pass finished");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!("Health monitor stopped");
    }

    /// Returns `false` on shutdown.
    async fn wait_for_work(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self.config.mode == MonitorMode::ErrorDriven && self.signal.is_all_right() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.signal.wait_for_error() => {}
            }
        }
        true
    }

    /// One repair pass over every registry. Returns whether everything was fixed.
    ///
    /// A registry that cannot be reconnected leaves the pass marked bad and
    /// the remaining registries are still tried.
    pub async fn run_pass(&self) -> bool {
        self.passes.inc();
        self.signal.set_all_right(true);

        let mut all_right = true;
        for registry in self.directory.registries().await {
            if !registry.has_errored_caches().await {
                continue;
            }

            match registry.reconnect().await {
                Ok(()) => {
                    self.repairs.inc();
                    info!(location = %registry.location(), "Registry repaired");
                }
                Err(e) => {
                    all_right = false;
                    self.failed_repairs.inc();
                    warn!(location = %registry.location(), error = %e, "Registry still unreachable");
                }
            }
        }

        if !all_right {
            self.signal.set_all_right(false);
        }
        all_right
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("passes", &self.passes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteCacheAttributes;
    use crate::error::{Error, Result};
    use crate::nowait::FacadeDirectory;
    use crate::service::{ConnectionResolver, ResolvedConnection};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use crate::testing::mocks::{wait_until, MockResolver, RecordingLocalCache};
    use crate::types::{CacheElement, CacheStatus, Location};
    use std::time::Duration;

    fn directory(resolver: Arc<MockResolver>) -> Arc<RegistryDirectory> {
        Arc::new(RegistryDirectory::new(
            resolver,
            Arc::new(MonitorSignal::new()),
            Arc::new(FacadeDirectory::new()),
        ))
    }

    #[test]
    fn test_signal_tracks_errors() {
        let signal = MonitorSignal::new();
        assert!(signal.is_all_right());
        signal.notify_error();
        assert!(!signal.is_all_right());
        assert_eq!(signal.error_reports(), 1);
    }

    #[tokio::test]
    async fn test_pass_repairs_reachable_registry_and_skips_healthy() {
        let resolver = Arc::new(MockResolver::new());
        let up = Location::new("up", 1);
        let down = Location::new("down", 1);
        let healthy = Location::new("healthy", 1);
        resolver.add_endpoint(&healthy);
        let dir = directory(resolver.clone());

        let local = Arc::new(RecordingLocalCache::new());
        for location in [&up, &down, &healthy] {
            let attrs = RemoteCacheAttributes::new("users", location.clone());
            dir.get_or_connect(location, &attrs)
                .await
                .get_cache(&attrs, local.clone())
                .await;
        }

        resolver.add_endpoint(&up);
        let monitor = HealthMonitor::new(MonitorConfig::default(), dir.clone());
        assert!(!monitor.run_pass().await);
        assert_eq!(monitor.repairs(), 1);
        assert_eq!(monitor.failed_repairs(), 1);
        assert_eq!(resolver.resolve_count(&healthy), 1);

        let repaired = dir.get(&up, "RemoteCacheService").await.unwrap();
        assert!(repaired.is_connected().await);
        assert_eq!(repaired.cache("users").await.unwrap().status(), CacheStatus::Alive);
        assert!(!monitor.signal.is_all_right());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_driven_loop_replays_buffered_writes() {
        let resolver = Arc::new(MockResolver::new());
        let primary = Location::new("primary", 1102);
        let dir = directory(resolver.clone());
        let attrs = RemoteCacheAttributes::new("users", primary.clone());

        let wrapper = dir
            .get_or_connect(&primary, &attrs)
            .await
            .get_cache(&attrs, Arc::new(RecordingLocalCache::new()))
            .await;
        wrapper.update(CacheElement::new("users", "u1", "v")).unwrap();
        wait_until(|| wrapper.queue().stats().processed == 1).await;

        let monitor = HealthMonitor::new(
            MonitorConfig::default().with_idle_period(Duration::from_secs(30)),
            dir.clone(),
        );
        monitor.start();
        assert!(monitor.is_running());

        let service = resolver.add_endpoint(&primary);
        // The connect failure already woke the monitor; the next pass finds the endpoint.
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_until(|| service.call_count() == 1).await;
        assert_eq!(service.calls(), vec!["update:users:u1"]);
        assert_eq!(wrapper.status(), CacheStatus::Alive);

        monitor.shutdown().await;
        assert!(!monitor.is_running());
    }

    /// Unreachable on the first lookup, then blows up.
    struct PanickingResolver {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionResolver for PanickingResolver {
        async fn resolve(&self, location: &Location, _service_name: &str) -> Result<ResolvedConnection> {
            if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Connect {
                    location: location.clone(),
                    reason: "down".into(),
                });
            }
            panic!("resolver failure");
        }
    }

    #[tokio::test]
    async fn test_shutdown_reports_crashed_loop() {
        let resolver = Arc::new(PanickingResolver {
            lookups: AtomicUsize::new(0),
        });
        let dir = Arc::new(RegistryDirectory::new(
            resolver,
            Arc::new(MonitorSignal::new()),
            Arc::new(FacadeDirectory::new()),
        ));
        let primary = Location::new("primary", 1102);
        let attrs = RemoteCacheAttributes::new("users", primary.clone());
        dir.get_or_connect(&primary, &attrs)
            .await
            .get_cache(&attrs, Arc::new(RecordingLocalCache::new()))
            .await;

        let monitor = HealthMonitor::new(MonitorConfig::default(), dir);
        monitor.start();
        wait_until(|| !monitor.is_running()).await;

        assert!(!monitor.shutdown().await);
        assert!(monitor.shutdown().await);
    }
}
