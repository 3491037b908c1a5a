//! Testing utilities for the remote cache client.
//!
//! `mocks` provides an in-memory network of remote cache servers whose
//! endpoints can be taken down and brought back during a test, plus recording
//! stand-ins for the local cache and the delivery target.
//!
//! # Example
//!
//! ```rust,ignore
//! use remcache::testing::mocks::{MockResolver, RecordingLocalCache};
//!
//! let resolver = Arc::new(MockResolver::new());
//! let primary = Location::new("primary", 1102);
//! let service = resolver.add_endpoint(&primary);
//!
//! let manager = RemoteCacheManager::new(resolver.clone(), ManagerConfig::default());
//! let users = manager
//!     .get_cache(RemoteCacheAttributes::new("users", primary.clone()), Arc::new(RecordingLocalCache::new()))
//!     .await?;
//!
//! resolver.set_reachable(&primary, false);
//! users.update(CacheElement::new("users", "u1", "v"))?; // buffered in the zombie
//! resolver.set_reachable(&primary, true);
//! manager.monitor().run_pass().await;                     // replayed to `service`
//! ```

pub mod mocks;

#[cfg(test)]
mod failover_scenario_tests;
#[cfg(test)]
mod recovery_scenario_tests;
