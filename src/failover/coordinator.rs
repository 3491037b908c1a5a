//! Moves a local-role facade onto a reachable server and back to the primary.
//!
//! ```text
//!   SearchingFailover ──found i>0──► ConnectedToFailover ──► RestoringPrimary
//!        │    ▲                                                │     │
//!        │    └────────────── active failover died ────────────┘     │
//!        └──found primary──► Done ◄────────── primary alive ─────────┘
//! ```
//!
//! A step that makes no progress is followed by one idle period. The
//! coordinator never gives up; it stops only when done or when the facade is
//! disposed.

use crate::failover::registry::RegistryDirectory;
use crate::nowait::{NoWaitFacade, NoWaitWrapper};
use crate::types::{CacheStatus, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coordinator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    SearchingFailover,
    ConnectedToFailover,
    RestoringPrimary,
    Done,
}

/// Clears the facade's failover flag when the coordinator ends.
#[derive(Debug)]
pub struct FailoverGuard(Arc<AtomicBool>);

impl FailoverGuard {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }
}

impl Drop for FailoverGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Background recovery of one facade.
pub struct FailoverCoordinator {
    facade: Arc<NoWaitFacade>,
    directory: Arc<RegistryDirectory>,
    state: FailoverState,
    _guard: Option<FailoverGuard>,
}

impl FailoverCoordinator {
    pub fn new(facade: Arc<NoWaitFacade>, directory: Arc<RegistryDirectory>) -> Self {
        let state = Self::initial_state(&facade);
        Self {
            facade,
            directory,
            state,
            _guard: None,
        }
    }

    /// Hold `guard` until the coordinator finishes.
    pub fn with_guard(mut self, guard: FailoverGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    fn initial_state(facade: &NoWaitFacade) -> FailoverState {
        if facade.failover_list().len() <= 1 {
            FailoverState::Done
        } else if facade.failover_index() > 0 {
            FailoverState::RestoringPrimary
        } else if facade.active_status() == CacheStatus::Error {
            FailoverState::SearchingFailover
        } else {
            FailoverState::Done
        }
    }

    /// Drive the state machine to `Done` or until the facade is disposed.
    pub async fn run(mut self) -> FailoverState {
        let idle = self.facade.attributes().effective_failover_idle_period();
        let shutdown = self.facade.shutdown_token();
        info!(region = %self.facade.region(), state = ?self.state, "Failover coordinator started");

        while self.state != FailoverState::Done {
            if shutdown.is_cancelled() {
                debug!(region = %self.facade.region(), "Facade disposed, failover stopped");
                break;
            }

            let (next, progressed) = self.step().await;
            if next != self.state {
                debug!(region = %self.facade.region(), from = ?self.state, to = ?next, "Failover state change");
            }
            self.state = next;

            if self.state != FailoverState::Done && !progressed {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }

        info!(
            region = %self.facade.region(),
            state = ?self.state,
            failover_index = self.facade.failover_index(),
            "Failover coordinator finished"
        );
        self.state
    }

    /// Run one step. Returns the next state and whether the step made progress.
    pub async fn step(&mut self) -> (FailoverState, bool) {
        match self.state {
            FailoverState::SearchingFailover => self.search().await,
            // Give the failover one idle period before probing the primary.
            FailoverState::ConnectedToFailover => (FailoverState::RestoringPrimary, false),
            FailoverState::RestoringPrimary => self.restore_primary().await,
            FailoverState::Done => (FailoverState::Done, true),
        }
    }

    /// Probe candidates from the current index onwards, wrapping around the list.
    async fn search(&mut self) -> (FailoverState, bool) {
        let list = self.facade.failover_list();
        let start = self.facade.failover_index().min(list.len().saturating_sub(1));

        for index in (start..list.len()).chain(0..start) {
            if self.facade.is_disposed() {
                return (FailoverState::Done, true);
            }
            if let Some(wrapper) = self.probe(&list[index]).await {
                self.swap_in(wrapper, index, &list).await;
                if index == 0 {
                    info!(region = %self.facade.region(), "Primary reachable, no failover needed");
                    return (FailoverState::Done, true);
                }
                self.facade.metrics().failover_swaps.inc();
                info!(region = %self.facade.region(), location = %list[index], failover_index = index, "Connected to failover server");
                return (FailoverState::ConnectedToFailover, true);
            }
        }

        warn!(region = %self.facade.region(), candidates = list.len(), "No remote cache server reachable");
        if self.facade.failover_index() > 0 {
            (FailoverState::RestoringPrimary, false)
        } else {
            (FailoverState::SearchingFailover, false)
        }
    }

    async fn restore_primary(&mut self) -> (FailoverState, bool) {
        let list = self.facade.failover_list();
        if self.facade.failover_index() == 0 && self.facade.active_status().is_alive() {
            return (FailoverState::Done, true);
        }

        match self.probe(&list[0]).await {
            Some(wrapper) => {
                self.swap_in(wrapper, 0, &list).await;
                self.facade.metrics().primary_restores.inc();
                info!(region = %self.facade.region(), location = %list[0], "Restored primary connection");
                (FailoverState::Done, true)
            }
            None if self.facade.active_status() == CacheStatus::Error => {
                warn!(region = %self.facade.region(), "Primary down and active failover failed, searching again");
                (FailoverState::SearchingFailover, true)
            }
            None => {
                debug!(region = %self.facade.region(), "Primary still down, staying on failover");
                (FailoverState::RestoringPrimary, false)
            }
        }
    }

    /// Connect to `location` and return its wrapper if it is alive.
    async fn probe(&self, location: &Location) -> Option<Arc<NoWaitWrapper>> {
        let attributes = self.facade.attributes();
        let registry = self.directory.get_or_connect(location, attributes).await;
        let wrapper = registry
            .get_cache(attributes, self.facade.local().clone())
            .await;

        if !wrapper.status().is_alive() {
            if let Err(e) = registry.reconnect().await {
                debug!(region = %attributes.region, location = %location, error = %e, "Probe failed");
                return None;
            }
        }
        wrapper.status().is_alive().then_some(wrapper)
    }

    /// Leave the current failover server, if any, and install `wrapper`.
    async fn swap_in(&self, wrapper: Arc<NoWaitWrapper>, index: usize, list: &[Location]) {
        let attributes = self.facade.attributes();
        let previous = self.facade.failover_index();

        if previous > 0 && previous != index {
            if let Some(location) = list.get(previous) {
                if let Some(registry) = self.directory.get(location, &attributes.service_name).await {
                    if let Err(e) = registry.remove_remote_cache_listener(attributes).await {
                        warn!(region = %attributes.region, location = %location, error = %e, "Could not deregister failover listener, continuing");
                    }
                }
            }
        }

        self.facade.swap_active(wrapper, index);
    }
}

impl std::fmt::Debug for FailoverCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("region", &self.facade.region())
            .field("state", &self.state)
            .finish()
    }
}
