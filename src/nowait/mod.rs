//! Non-blocking access to remote regions.
//!
//! Writes are queued per region and delivered in order by a background task;
//! reads go to the remote server directly.

pub mod facade;
pub mod queue;
pub mod wrapper;

pub use facade::{FacadeDirectory, FacadeStats, NoWaitFacade};
pub use queue::{AsyncDeliveryQueue, CacheEvent, CacheEventHandler, QueueConfig, QueueStats};
pub use wrapper::{NoWaitStats, NoWaitWrapper};
