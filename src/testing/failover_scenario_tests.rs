//! End-to-end failover tests through `RemoteCacheManager`.
//!
//! These tests verify:
//! - Startup with an unreachable primary moves the region to a failover
//! - Writes follow the active server
//! - The primary is restored and the failover listener dropped
//!
//! Time is paused so idle periods pass instantly.

#[cfg(test)]
mod tests {
    use crate::config::{ManagerConfig, RemoteCacheAttributes};
    use crate::manager::RemoteCacheManager;
    use crate::testing::mocks::{wait_until_for, MockResolver, RecordingLocalCache};
    use crate::types::{CacheElement, CacheStatus, Location};
    use std::sync::Arc;
    use std::time::Duration;

    const PATIENCE: Duration = Duration::from_secs(180);

    fn primary() -> Location {
        Location::new("primary", 1102)
    }

    fn failover() -> Location {
        Location::new("failover", 1102)
    }

    fn attrs() -> RemoteCacheAttributes {
        RemoteCacheAttributes::new("R1", primary())
            .with_failover_servers(vec![failover()])
            .with_event_retry(3, Duration::from_millis(10))
    }

    fn called(calls: &[String], call: &str) -> bool {
        calls.iter().any(|c| c == call)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_and_primary_restoration() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .try_init();

        let resolver = Arc::new(MockResolver::new());
        let f_service = resolver.add_endpoint(&failover());
        let manager = RemoteCacheManager::new(resolver.clone(), ManagerConfig::default());

        let facade = manager
            .get_cache(attrs(), Arc::new(RecordingLocalCache::new()))
            .await
            .unwrap();
        facade.update(CacheElement::new("R1", "e1", "v1")).unwrap();

        wait_until_for(|| facade.failover_index() == 1, PATIENCE).await;
        assert_eq!(facade.active_status(), CacheStatus::Alive);

        facade.update(CacheElement::new("R1", "e2", "v2")).unwrap();
        wait_until_for(|| called(&f_service.calls(), "update:R1:e2"), PATIENCE).await;

        let p_service = resolver.add_endpoint(&primary());
        wait_until_for(|| facade.failover_index() == 0, PATIENCE).await;
        assert_eq!(facade.active_status(), CacheStatus::Alive);
        assert!(resolver.observer(&failover()).registered("R1").is_empty());

        // e1 went out either before the swap (buffered for the primary) or after it.
        wait_until_for(
            || called(&p_service.calls(), "update:R1:e1") || called(&f_service.calls(), "update:R1:e1"),
            PATIENCE,
        )
        .await;

        facade.update(CacheElement::new("R1", "e3", "v3")).unwrap();
        wait_until_for(|| called(&p_service.calls(), "update:R1:e3"), PATIENCE).await;
        assert!(!called(&f_service.calls(), "update:R1:e3"));

        let stats = facade.stats();
        assert_eq!(stats.failover_swaps, 1);
        assert!(!stats.failover_running);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_never_fail_while_everything_is_down() {
        let resolver = Arc::new(MockResolver::new());
        let manager = RemoteCacheManager::new(resolver.clone(), ManagerConfig::default());
        let facade = manager
            .get_cache(attrs(), Arc::new(RecordingLocalCache::new()))
            .await
            .unwrap();

        assert!(facade.get("e1").await.is_none());
        assert!(facade.get_matching("e.*").await.is_empty());
        facade.update(CacheElement::new("R1", "e1", "v1")).unwrap();
        facade.remove("e1");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(facade.failover_index(), 0);
        assert!(facade.is_failover_running());

        manager.shutdown().await;
        wait_until_for(|| !facade.is_failover_running(), PATIENCE).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_server_lost_while_primary_down() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();

        let resolver = Arc::new(MockResolver::new());
        let second = Location::new("second", 1102);
        resolver.add_endpoint(&failover());
        let s_service = resolver.add_endpoint(&second);
        let manager = RemoteCacheManager::new(resolver.clone(), ManagerConfig::default());

        let facade = manager
            .get_cache(
                attrs().with_failover_servers(vec![failover(), second.clone()]),
                Arc::new(RecordingLocalCache::new()),
            )
            .await
            .unwrap();
        wait_until_for(|| facade.failover_index() == 1, PATIENCE).await;

        // The active failover dies; writes fail over to the next server.
        resolver.set_reachable(&failover(), false);
        facade.update(CacheElement::new("R1", "k", "v")).unwrap();
        wait_until_for(|| facade.failover_index() == 2, PATIENCE).await;

        facade.update(CacheElement::new("R1", "k2", "v")).unwrap();
        wait_until_for(|| called(&s_service.calls(), "update:R1:k2"), PATIENCE).await;

        manager.shutdown().await;
    }
}
