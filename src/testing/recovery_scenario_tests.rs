//! Recovery tests through the health monitor.
//!
//! These tests verify:
//! - Writes buffered while disconnected are replayed in order, within bounds
//! - Listener ids survive a reconnect of the same server
//! - Remote notifications reach the local cache
//! - The time-driven monitor repairs without an error signal

#[cfg(test)]
mod tests {
    use crate::config::{
        ManagerConfig, MonitorConfig, MonitorMode, RemoteCacheAttributes, ZombieOverflowPolicy,
    };
    use crate::manager::RemoteCacheManager;
    use crate::service::CacheEventListener;
    use crate::testing::mocks::{wait_until, wait_until_for, LocalOp, MockResolver, RecordingLocalCache};
    use crate::types::{CacheElement, CacheEntry, CacheStatus, Location, SerializedCacheElement};
    use std::sync::Arc;
    use std::time::Duration;

    fn primary() -> Location {
        Location::new("primary", 1102)
    }

    fn manual_manager(resolver: Arc<MockResolver>) -> RemoteCacheManager {
        RemoteCacheManager::new(resolver, ManagerConfig::default().with_start_monitor(false))
    }

    #[tokio::test]
    async fn test_buffered_writes_replayed_in_order_and_bounded() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .try_init();

        let resolver = Arc::new(MockResolver::new());
        let manager = manual_manager(resolver.clone());
        let attrs = RemoteCacheAttributes::new("users", primary())
            .with_zombie_queue_max_size(3)
            .with_zombie_overflow_policy(ZombieOverflowPolicy::RejectNewest);

        let facade = manager
            .get_cache(attrs, Arc::new(RecordingLocalCache::new()))
            .await
            .unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            facade.update(CacheElement::new("users", key, "v")).unwrap();
        }
        let wrapper = facade.active().unwrap();
        wait_until(|| wrapper.queue().stats().processed == 5).await;

        let service = resolver.add_endpoint(&primary());
        assert!(manager.monitor().run_pass().await);

        assert_eq!(
            service.calls(),
            vec!["update:users:a", "update:users:b", "update:users:c"]
        );
        assert_eq!(facade.status(), CacheStatus::Alive);

        // A second pass has nothing left to repair or replay.
        assert!(manager.monitor().run_pass().await);
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn test_listener_id_kept_across_reconnect() {
        let resolver = Arc::new(MockResolver::new());
        let service = resolver.add_endpoint(&primary());
        let manager = manual_manager(resolver.clone());

        let facade = manager
            .get_cache(
                RemoteCacheAttributes::new("users", primary())
                    .with_event_retry(0, Duration::from_millis(1)),
                Arc::new(RecordingLocalCache::new()),
            )
            .await
            .unwrap();
        let wrapper = facade.active().unwrap();
        let id = wrapper.client().listener_id();
        assert!(id > 0);

        service.set_failing(true);
        facade.update(CacheElement::new("users", "lost", "v")).unwrap();
        wait_until(|| wrapper.status() == CacheStatus::Error).await;

        service.set_failing(false);
        assert!(manager.monitor().run_pass().await);
        assert_eq!(wrapper.status(), CacheStatus::Alive);
        assert_eq!(wrapper.client().listener_id(), id);
        assert_eq!(resolver.observer(&primary()).registered("users"), vec![id]);
    }

    #[tokio::test]
    async fn test_remote_notifications_reach_local_cache() {
        let resolver = Arc::new(MockResolver::new());
        resolver.add_endpoint(&primary());
        let manager = manual_manager(resolver.clone());
        let local = Arc::new(RecordingLocalCache::new());

        manager
            .get_cache(RemoteCacheAttributes::new("users", primary()), local.clone())
            .await
            .unwrap();

        let element = CacheElement::new("users", "u1", "v");
        let observer = resolver.observer(&primary());
        observer
            .broadcast_put(SerializedCacheElement::from_element(&element).unwrap().into())
            .unwrap();
        observer.broadcast_remove("users", "u2").unwrap();

        assert_eq!(
            local.ops(),
            vec![
                LocalOp::Update(CacheEntry::Raw(element)),
                LocalOp::Remove("u2".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_get_only_region_never_writes() {
        let resolver = Arc::new(MockResolver::new());
        let service = resolver.add_endpoint(&primary());
        let manager = manual_manager(resolver);
        let facade = manager
            .get_cache(
                RemoteCacheAttributes::new("users", primary()).with_get_only(true),
                Arc::new(RecordingLocalCache::new()),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            facade.update(CacheElement::new("users", "u1", "v")).unwrap();
            facade.remove("u1");
            facade.remove_all();
        }
        let wrapper = facade.active().unwrap();
        wait_until(|| wrapper.queue().stats().processed == 9).await;
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_driven_monitor_repairs_without_signal() {
        let resolver = Arc::new(MockResolver::new());
        let manager = RemoteCacheManager::new(
            resolver.clone(),
            ManagerConfig::default().with_monitor(
                MonitorConfig::default()
                    .with_mode(MonitorMode::TimeDriven)
                    .with_idle_period(Duration::from_secs(5)),
            ),
        );
        assert_eq!(
            manager.monitor().config().effective_idle_period(),
            Duration::from_secs(30)
        );

        let facade = manager
            .get_cache(
                RemoteCacheAttributes::new("users", primary()),
                Arc::new(RecordingLocalCache::new()),
            )
            .await
            .unwrap();
        facade.update(CacheElement::new("users", "u1", "v")).unwrap();

        let service = resolver.add_endpoint(&primary());
        wait_until_for(|| service.call_count() == 1, Duration::from_secs(120)).await;
        assert_eq!(service.calls(), vec!["update:users:u1"]);
        assert!(manager.monitor().passes() >= 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_reset_requests_new_registration() {
        let resolver = Arc::new(MockResolver::new());
        resolver.add_endpoint(&primary());
        let manager = manual_manager(resolver);
        let facade = manager
            .get_cache(
                RemoteCacheAttributes::new("users", primary()),
                Arc::new(RecordingLocalCache::new()),
            )
            .await
            .unwrap();

        let listener = facade.active().unwrap().client().listener().clone();
        assert!(listener.listener_id() > 0);
        listener.reset_listener_id();
        assert_eq!(listener.listener_id(), 0);
    }
}
