//! Metrics for the remote cache layers.
//!
//! Every layer keeps its own named atomic counters and exposes a plain
//! snapshot struct; nothing here is a mutable field shared across tasks.
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  ┌──────────────┐
//! │ NoWaitFacade │  │ NoWaitWrapper│  │ DeliveryQueue  │  │ ZombieService│
//! │ - failovers  │  │ - gets/puts  │  │ - processed    │  │ - buffered   │
//! │ - restores   │  │ - removes    │  │ - failed       │  │ - dropped    │
//! └──────────────┘  └──────────────┘  └────────────────┘  └──────────────┘
//! ```

mod counters;

pub use counters::Counter;

/// Counters of a `NoWaitWrapper`.
#[derive(Debug)]
pub struct NoWaitMetrics {
    /// Single-key reads.
    pub gets: Counter,
    /// Pattern reads.
    pub get_matchings: Counter,
    /// Multi-key reads.
    pub get_multiples: Counter,
    /// Updates handed to the queue.
    pub updates: Counter,
    /// Removes handed to the queue.
    pub removes: Counter,
    /// Remove-alls handed to the queue.
    pub remove_alls: Counter,
    /// Disposes handed to the queue.
    pub disposes: Counter,
    /// Reads retried after an unmarshal failure.
    pub unmarshal_retries: Counter,
}

impl NoWaitMetrics {
    /// Fresh counters.
    pub fn new() -> Self {
        Self {
            gets: Counter::new("nowait_gets", "Single-key reads"),
            get_matchings: Counter::new("nowait_get_matchings", "Pattern reads"),
            get_multiples: Counter::new("nowait_get_multiples", "Multi-key reads"),
            updates: Counter::new("nowait_updates", "Updates handed to the delivery queue"),
            removes: Counter::new("nowait_removes", "Removes handed to the delivery queue"),
            remove_alls: Counter::new(
                "nowait_remove_alls",
                "Remove-alls handed to the delivery queue",
            ),
            disposes: Counter::new("nowait_disposes", "Disposes handed to the delivery queue"),
            unmarshal_retries: Counter::new(
                "nowait_unmarshal_retries",
                "Reads retried after an unmarshal failure",
            ),
        }
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> NoWaitMetricsSnapshot {
        NoWaitMetricsSnapshot {
            gets: self.gets.get(),
            get_matchings: self.get_matchings.get(),
            get_multiples: self.get_multiples.get(),
            updates: self.updates.get(),
            removes: self.removes.get(),
            remove_alls: self.remove_alls.get(),
            disposes: self.disposes.get(),
            unmarshal_retries: self.unmarshal_retries.get(),
        }
    }
}

impl Default for NoWaitMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of `NoWaitMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoWaitMetricsSnapshot {
    pub gets: u64,
    pub get_matchings: u64,
    pub get_multiples: u64,
    pub updates: u64,
    pub removes: u64,
    pub remove_alls: u64,
    pub disposes: u64,
    pub unmarshal_retries: u64,
}

/// Counters of an `AsyncDeliveryQueue`.
#[derive(Debug)]
pub struct QueueMetrics {
    /// Events accepted.
    pub enqueued: Counter,
    /// Events delivered.
    pub processed: Counter,
    /// Events given up on after all retries.
    pub failed: Counter,
    /// Delivery attempts that were retried.
    pub retries: Counter,
}

impl QueueMetrics {
    /// Fresh counters.
    pub fn new() -> Self {
        Self {
            enqueued: Counter::new("queue_enqueued", "Events accepted by the delivery queue"),
            processed: Counter::new("queue_processed", "Events delivered"),
            failed: Counter::new("queue_failed", "Events dropped after all retries"),
            retries: Counter::new("queue_retries", "Delivery attempts that were retried"),
        }
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of a `NoWaitFacade`.
#[derive(Debug)]
pub struct FacadeMetrics {
    /// Failover coordinators started.
    pub failovers_started: Counter,
    /// Swaps onto a failover server.
    pub failover_swaps: Counter,
    /// Swaps back onto the primary.
    pub primary_restores: Counter,
}

impl FacadeMetrics {
    /// Fresh counters.
    pub fn new() -> Self {
        Self {
            failovers_started: Counter::new("facade_failovers_started", "Failover tasks started"),
            failover_swaps: Counter::new("facade_failover_swaps", "Swaps onto a failover server"),
            primary_restores: Counter::new("facade_primary_restores", "Swaps back onto the primary"),
        }
    }
}

impl Default for FacadeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
