//! Configuration types for the remote cache client.

use crate::error::{Error, Result};
use crate::types::{Location, RemoteType};
use std::time::Duration;

/// Shortest pause between failover attempts.
pub const MIN_FAILOVER_IDLE_PERIOD: Duration = Duration::from_secs(20);

/// Shortest pause between health monitor passes.
pub const MIN_MONITOR_IDLE_PERIOD: Duration = Duration::from_secs(30);

/// What a disconnected handle does once its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieOverflowPolicy {
    /// Log and discard the event that did not fit.
    RejectNewest,
    /// Discard the oldest buffered event to make room.
    DropOldest,
    /// Refuse the event and report an error to the caller.
    Fail,
}

/// Per-region configuration of a remote cache.
#[derive(Debug, Clone)]
pub struct RemoteCacheAttributes {
    /// Region name.
    pub region: String,

    /// Local (failover) or cluster (peer fanout) role.
    pub remote_type: RemoteType,

    /// Primary server.
    pub remote_location: Option<Location>,

    /// Failover servers in priority order, not including the primary.
    pub failover_servers: Vec<Location>,

    /// Peers for the cluster role.
    pub cluster_servers: Vec<Location>,

    /// Name the service is registered under on each endpoint.
    pub service_name: String,

    /// Timeout for gets in milliseconds. Zero or less calls the service directly.
    pub get_timeout_millis: i64,

    /// Never send updates or removals to the server.
    pub get_only: bool,

    /// Register a listener for server-side notifications.
    pub receive: bool,

    /// Maximum number of events buffered while disconnected.
    pub zombie_queue_max_size: usize,

    /// What happens when the disconnected buffer is full.
    pub zombie_overflow_policy: ZombieOverflowPolicy,

    /// Remove the local copy on a remote put instead of updating it.
    pub remove_upon_remote_put: bool,

    /// Cluster-role listeners hand plain elements to the local cache
    /// instead of the encoded form peers exchange.
    pub local_cluster_consistency: bool,

    /// Name of the worker pool used for timed gets.
    pub thread_pool_name: String,

    /// Concurrent timed gets allowed per client.
    pub get_pool_size: usize,

    /// Capacity of the asynchronous delivery queue.
    pub event_queue_capacity: usize,

    /// Retries for an event that failed to deliver.
    pub event_max_failure: usize,

    /// Pause between delivery retries.
    pub event_wait_before_retry: Duration,

    /// Pause between failover attempts.
    pub failover_idle_period: Duration,
}

impl Default for RemoteCacheAttributes {
    fn default() -> Self {
        Self {
            region: String::new(),
            remote_type: RemoteType::Local,
            remote_location: None,
            failover_servers: Vec::new(),
            cluster_servers: Vec::new(),
            service_name: "RemoteCacheService".to_string(),
            get_timeout_millis: -1,
            get_only: false,
            receive: true,
            zombie_queue_max_size: 1000,
            zombie_overflow_policy: ZombieOverflowPolicy::RejectNewest,
            remove_upon_remote_put: false,
            local_cluster_consistency: false,
            thread_pool_name: "remote_cache_client".to_string(),
            get_pool_size: 10,
            event_queue_capacity: 10_000,
            event_max_failure: 3,
            event_wait_before_retry: Duration::from_millis(500),
            failover_idle_period: MIN_FAILOVER_IDLE_PERIOD,
        }
    }
}

impl RemoteCacheAttributes {
    /// Local-role attributes for a region served by `primary`.
    pub fn new(region: impl Into<String>, primary: Location) -> Self {
        Self {
            region: region.into(),
            remote_location: Some(primary),
            ..Default::default()
        }
    }

    /// Cluster-role attributes for a region replicated to `peers`.
    pub fn cluster(region: impl Into<String>, peers: Vec<Location>) -> Self {
        Self {
            region: region.into(),
            remote_type: RemoteType::Cluster,
            cluster_servers: peers,
            ..Default::default()
        }
    }

    /// Set the failover servers.
    pub fn with_failover_servers(mut self, servers: Vec<Location>) -> Self {
        self.failover_servers = servers;
        self
    }

    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the get timeout in milliseconds.
    pub fn with_get_timeout_millis(mut self, millis: i64) -> Self {
        self.get_timeout_millis = millis;
        self
    }

    /// Enable or disable get-only mode.
    pub fn with_get_only(mut self, get_only: bool) -> Self {
        self.get_only = get_only;
        self
    }

    /// Enable or disable listener registration.
    pub fn with_receive(mut self, receive: bool) -> Self {
        self.receive = receive;
        self
    }

    /// Set the disconnected buffer size.
    pub fn with_zombie_queue_max_size(mut self, size: usize) -> Self {
        self.zombie_queue_max_size = size;
        self
    }

    /// Set the disconnected buffer overflow policy.
    pub fn with_zombie_overflow_policy(mut self, policy: ZombieOverflowPolicy) -> Self {
        self.zombie_overflow_policy = policy;
        self
    }

    /// Remove instead of update on remote puts.
    pub fn with_remove_upon_remote_put(mut self, enabled: bool) -> Self {
        self.remove_upon_remote_put = enabled;
        self
    }

    /// Set local cluster consistency.
    pub fn with_local_cluster_consistency(mut self, enabled: bool) -> Self {
        self.local_cluster_consistency = enabled;
        self
    }

    /// Set the timed-get pool name and size.
    pub fn with_get_pool(mut self, name: impl Into<String>, size: usize) -> Self {
        self.thread_pool_name = name.into();
        self.get_pool_size = size;
        self
    }

    /// Set the delivery queue capacity.
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set delivery retry behaviour.
    pub fn with_event_retry(mut self, max_failure: usize, wait: Duration) -> Self {
        self.event_max_failure = max_failure;
        self.event_wait_before_retry = wait;
        self
    }

    /// Set the failover idle period. Values under the minimum are raised to it.
    pub fn with_failover_idle_period(mut self, period: Duration) -> Self {
        self.failover_idle_period = period.max(MIN_FAILOVER_IDLE_PERIOD);
        self
    }

    /// The get timeout, if timed gets are enabled.
    pub fn get_timeout(&self) -> Option<Duration> {
        (self.get_timeout_millis > 0).then(|| Duration::from_millis(self.get_timeout_millis as u64))
    }

    /// The failover idle period, never below the minimum.
    pub fn effective_failover_idle_period(&self) -> Duration {
        self.failover_idle_period.max(MIN_FAILOVER_IDLE_PERIOD)
    }

    /// Primary followed by the failover servers, primary never repeated.
    pub fn failover_list(&self) -> Vec<Location> {
        let mut list = Vec::with_capacity(self.failover_servers.len() + 1);
        if let Some(primary) = &self.remote_location {
            list.push(primary.clone());
        }
        for server in &self.failover_servers {
            if !list.contains(server) {
                list.push(server.clone());
            }
        }
        list
    }

    /// Check the attributes for impossible combinations.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::Config("region name must not be empty".into()));
        }
        if self.zombie_queue_max_size == 0 {
            return Err(Error::Config(format!(
                "region {}: zombie queue size must be positive",
                self.region
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::Config(format!(
                "region {}: event queue capacity must be positive",
                self.region
            )));
        }
        match self.remote_type {
            RemoteType::Local if self.remote_location.is_none() => Err(Error::Config(format!(
                "region {}: local role needs a primary server",
                self.region
            ))),
            RemoteType::Cluster if self.cluster_servers.is_empty() => Err(Error::Config(
                format!("region {}: cluster role needs at least one peer", self.region),
            )),
            _ => Ok(()),
        }
    }
}

/// How the health monitor decides when to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Sleep until an error is reported.
    ErrorDriven,
    /// Run every idle period.
    TimeDriven,
}

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Wake-up strategy.
    pub mode: MonitorMode,
    /// Pause between passes.
    pub idle_period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: MonitorMode::ErrorDriven,
            idle_period: MIN_MONITOR_IDLE_PERIOD,
        }
    }
}

impl MonitorConfig {
    /// Set the wake-up strategy.
    pub fn with_mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the idle period.
    pub fn with_idle_period(mut self, period: Duration) -> Self {
        self.idle_period = period;
        self
    }

    /// The idle period, never below the minimum.
    pub fn effective_idle_period(&self) -> Duration {
        self.idle_period.max(MIN_MONITOR_IDLE_PERIOD)
    }
}

/// Configuration of the top-level manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Health monitor settings.
    pub monitor: MonitorConfig,
    /// Spawn the health monitor on construction.
    pub start_monitor: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            start_monitor: true,
        }
    }
}

impl ManagerConfig {
    /// Set monitor configuration.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Start or skip the health monitor.
    pub fn with_start_monitor(mut self, start: bool) -> Self {
        self.start_monitor = start;
        self
    }
}
