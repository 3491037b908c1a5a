//! Remote cache client with non-blocking writes, zombie buffering and
//! automatic failover.
//!
//! This crate connects an in-process cache to one or more remote cache
//! servers:
//! - **Non-blocking writes**: updates and removes are queued per region and
//!   delivered in order by a background task
//! - **Zombie buffering**: while a server is unreachable, writes are buffered
//!   and replayed once it is back
//! - **Failover**: a local-role region moves to the next reachable server
//!   and returns to its primary as soon as it recovers
//! - **Cluster fanout**: a cluster-role region writes to every peer
//!
//! # Example
//!
//! ```rust,ignore
//! use remcache::{Location, ManagerConfig, RemoteCacheAttributes, RemoteCacheManager};
//! use std::sync::Arc;
//!
//! let manager = RemoteCacheManager::new(resolver, ManagerConfig::default());
//!
//! let attributes = RemoteCacheAttributes::new("users", "cache-a:1102".parse()?)
//!     .with_failover_servers(vec!["cache-b:1102".parse()?])
//!     .with_get_timeout_millis(500);
//! let users = manager.get_cache(attributes, local_cache).await?;
//!
//! // Queued; never waits on the network
//! users.update(CacheElement::new("users", "u:1", "Alice"))?;
//!
//! // Reads go to the server and never fail; errors read as a miss
//! let hit = users.get("u:1").await;
//!
//! manager.shutdown().await;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                RemoteCacheManager                │
//! │  region → NoWaitFacade     HealthMonitor         │
//! └──────────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌──────────────────┐      ┌───────────────────────┐
//! │   NoWaitFacade   │─────►│  FailoverCoordinator  │
//! │  slot 0 = active │      └───────────────────────┘
//! └──────────────────┘                │
//!          │                          ▼
//!          ▼                ┌───────────────────────┐
//! ┌──────────────────┐      │  ConnectionRegistry   │
//! │  NoWaitWrapper   │◄─────│  per location         │
//! │  queue + client  │      └───────────────────────┘
//! └──────────────────┘
//!          │
//!          ▼
//!   ServiceHandle::Live ─ or ─ ServiceHandle::Zombie
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod failover;
pub mod manager;
pub mod metrics;
pub mod nowait;
pub mod service;
pub mod testing;
pub mod types;

pub use client::{RemoteCacheClient, RemoteCacheListener, ServiceHandle, ZombieService};
pub use config::{
    ManagerConfig, MonitorConfig, MonitorMode, RemoteCacheAttributes, ZombieOverflowPolicy,
};
pub use error::{Error, Result};
pub use failover::{
    ConnectionRegistry, FailoverCoordinator, FailoverState, HealthMonitor, MonitorSignal,
    RegistryDirectory,
};
pub use manager::RemoteCacheManager;
pub use metrics::Counter;
pub use nowait::{AsyncDeliveryQueue, FacadeStats, NoWaitFacade, NoWaitStats, NoWaitWrapper};
pub use service::{
    CacheEventListener, ConnectionResolver, LocalCache, RemoteCacheObserver, RemoteCacheService,
    ResolvedConnection,
};
pub use types::{
    CacheElement, CacheEntry, CacheStatus, ElementAttributes, ListenerId, Location, RemoteType,
    SerializedCacheElement,
};
