//! Recovery: endpoint registries, the failover state machine and the health monitor.
//!
//! ```text
//!   RemoteCacheManager
//!     ├── RegistryDirectory ── ConnectionRegistry (per location + service)
//!     │                          └── region → NoWaitWrapper
//!     ├── HealthMonitor ── woken by MonitorSignal, reconnects errored registries
//!     └── NoWaitFacade::failover ── spawns FailoverCoordinator (one per facade)
//! ```

pub mod coordinator;
pub mod monitor;
pub mod registry;

pub use coordinator::{FailoverCoordinator, FailoverGuard, FailoverState};
pub use monitor::{HealthMonitor, MonitorSignal};
pub use registry::{ConnectionRegistry, RegistryDirectory};
