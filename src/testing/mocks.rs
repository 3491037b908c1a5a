//! In-memory remote servers with fault injection.
//!
//! `MockResolver` plays the network: each location maps to one
//! `MockRemoteService` and one `MockObserver`, and can be made reachable or
//! unreachable at any point of a test.

use crate::error::{Error, Result};
use crate::nowait::CacheEventHandler;
use crate::service::{
    CacheEventListener, ConnectionResolver, LocalCache, RemoteCacheObserver, RemoteCacheService,
    ResolvedConnection,
};
use crate::types::{CacheEntry, ListenerId, Location};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll `condition` every few milliseconds until it holds.
///
/// Panics after about ten seconds of (possibly virtual) time.
pub async fn wait_until(condition: impl Fn() -> bool) {
    wait_until_for(condition, Duration::from_secs(10)).await
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn wait_until_for(condition: impl Fn() -> bool, timeout: Duration) {
    let step = Duration::from_millis(5);
    let mut waited = Duration::ZERO;
    while !condition() {
        if waited >= timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[derive(Default)]
struct ServiceState {
    data: HashMap<(String, String), CacheEntry>,
    calls: Vec<String>,
}

/// A remote cache server holding entries in memory and recording every
/// successful call as `op:region[:key]`.
pub struct MockRemoteService {
    name: String,
    state: Mutex<ServiceState>,
    failing: AtomicBool,
    // Successful calls left before failing; negative means unlimited.
    fail_after: AtomicI64,
    hang_gets: AtomicBool,
    unmarshal_failures: AtomicUsize,
    update_delay: Mutex<Option<Duration>>,
}

impl MockRemoteService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ServiceState::default()),
            failing: AtomicBool::new(false),
            fail_after: AtomicI64::new(-1),
            hang_gets: AtomicBool::new(false),
            unmarshal_failures: AtomicUsize::new(0),
            update_delay: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Successful calls in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn stored(&self, region: &str, key: &str) -> Option<CacheEntry> {
        self.state
            .lock()
            .data
            .get(&(region.to_string(), key.to_string()))
            .cloned()
    }

    /// Store an entry without recording a call.
    pub fn seed(&self, entry: CacheEntry) {
        let key = (entry.region().to_string(), entry.key().to_string());
        self.state.lock().data.insert(key, entry);
    }

    /// Fail every call with a remote I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
        if !failing {
            self.fail_after.store(-1, Ordering::SeqCst);
        }
    }

    /// Allow `calls` more successful calls, then fail.
    pub fn fail_after(&self, calls: usize) {
        self.fail_after.store(calls as i64, Ordering::SeqCst);
    }

    /// Make gets pend forever.
    pub fn set_hang_gets(&self, hang: bool) {
        self.hang_gets.store(hang, Ordering::SeqCst);
    }

    /// Sleep for `delay` after recording each update.
    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock() = Some(delay);
    }

    /// Fail the next `count` reads with an unmarshal error.
    pub fn fail_gets_with_unmarshal(&self, count: usize) {
        self.unmarshal_failures.store(count, Ordering::SeqCst);
    }

    fn check(&self, call: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::RemoteIo(format!("{}: {} refused", self.name, call)));
        }
        let budget = self.fail_after.load(Ordering::SeqCst);
        if budget == 0 {
            self.failing.store(true, Ordering::SeqCst);
            return Err(Error::RemoteIo(format!("{}: {} refused", self.name, call)));
        }
        if budget > 0 {
            self.fail_after.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn check_read(&self, call: &str) -> Result<()> {
        self.check(call)?;
        let injected = self
            .unmarshal_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Unmarshal(format!("{}: garbled {} reply", self.name, call)));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl RemoteCacheService for MockRemoteService {
    async fn update(&self, entry: CacheEntry, _requester_id: ListenerId) -> Result<()> {
        self.check("update")?;
        {
            let mut state = self.state.lock();
            state
                .calls
                .push(format!("update:{}:{}", entry.region(), entry.key()));
            state
                .data
                .insert((entry.region().to_string(), entry.key().to_string()), entry);
        }
        let delay = *self.update_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get(&self, region: &str, key: &str, _requester_id: ListenerId) -> Result<Option<CacheEntry>> {
        if self.hang_gets.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_read("get")?;
        self.record(format!("get:{}:{}", region, key));
        Ok(self.stored(region, key))
    }

    async fn get_matching(
        &self,
        region: &str,
        pattern: &str,
        _requester_id: ListenerId,
    ) -> Result<HashMap<String, CacheEntry>> {
        self.check_read("get_matching")?;
        let mut state = self.state.lock();
        state.calls.push(format!("get_matching:{}:{}", region, pattern));
        Ok(state
            .data
            .iter()
            .filter(|((r, k), _)| r == region && matches_pattern(pattern, k))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_multiple(
        &self,
        region: &str,
        keys: &HashSet<String>,
        _requester_id: ListenerId,
    ) -> Result<HashMap<String, CacheEntry>> {
        self.check_read("get_multiple")?;
        let mut state = self.state.lock();
        state.calls.push(format!("get_multiple:{}", region));
        Ok(keys
            .iter()
            .filter_map(|k| {
                state
                    .data
                    .get(&(region.to_string(), k.clone()))
                    .map(|v| (k.clone(), v.clone()))
            })
            .collect())
    }

    async fn get_key_set(&self, region: &str) -> Result<HashSet<String>> {
        self.check_read("get_key_set")?;
        let mut state = self.state.lock();
        state.calls.push(format!("get_key_set:{}", region));
        Ok(state
            .data
            .keys()
            .filter(|(r, _)| r == region)
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn remove(&self, region: &str, key: &str, _requester_id: ListenerId) -> Result<bool> {
        self.check("remove")?;
        let mut state = self.state.lock();
        state.calls.push(format!("remove:{}:{}", region, key));
        Ok(state
            .data
            .remove(&(region.to_string(), key.to_string()))
            .is_some())
    }

    async fn remove_all(&self, region: &str, _requester_id: ListenerId) -> Result<()> {
        self.check("remove_all")?;
        let mut state = self.state.lock();
        state.calls.push(format!("remove_all:{}", region));
        state.data.retain(|(r, _), _| r != region);
        Ok(())
    }

    async fn dispose(&self, region: &str) -> Result<()> {
        self.check("dispose")?;
        self.record(format!("dispose:{}", region));
        Ok(())
    }
}

/// Listener registration endpoint assigning increasing ids from 1.
pub struct MockObserver {
    next_id: AtomicI64,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Arc<dyn CacheEventListener>)>>>,
    failing: AtomicBool,
}

impl MockObserver {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            listeners: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Ids registered for `region`, in registration order.
    pub fn registered(&self, region: &str) -> Vec<ListenerId> {
        self.listeners
            .lock()
            .get(region)
            .map(|ls| ls.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    /// Fail registration and deregistration.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Push a put to every listener of the entry's region.
    pub fn broadcast_put(&self, entry: CacheEntry) -> Result<()> {
        let listeners = self.listeners_of(entry.region());
        for listener in listeners {
            listener.handle_put(entry.clone())?;
        }
        Ok(())
    }

    /// Push a remove to every listener of `region`.
    pub fn broadcast_remove(&self, region: &str, key: &str) -> Result<()> {
        for listener in self.listeners_of(region) {
            listener.handle_remove(region, key)?;
        }
        Ok(())
    }

    fn listeners_of(&self, region: &str) -> Vec<Arc<dyn CacheEventListener>> {
        self.listeners
            .lock()
            .get(region)
            .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for MockObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCacheObserver for MockObserver {
    async fn add_cache_listener(
        &self,
        region: &str,
        listener: Arc<dyn CacheEventListener>,
    ) -> Result<ListenerId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::RemoteIo("observer refused registration".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .entry(region.to_string())
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    async fn remove_cache_listener(&self, region: &str, listener_id: ListenerId) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::RemoteIo("observer refused deregistration".into()));
        }
        if let Some(listeners) = self.listeners.lock().get_mut(region) {
            listeners.retain(|(id, _)| *id != listener_id);
        }
        Ok(())
    }
}

struct Endpoint {
    service: Arc<MockRemoteService>,
    observer: Arc<MockObserver>,
    reachable: bool,
}

/// Resolver over a set of in-memory endpoints.
pub struct MockResolver {
    endpoints: Mutex<HashMap<Location, Endpoint>>,
    resolves: Mutex<HashMap<Location, usize>>,
}

impl MockResolver {
    /// A resolver where nothing is reachable yet.
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            resolves: Mutex::new(HashMap::new()),
        }
    }

    /// Make `location` reachable and healthy, returning its service.
    pub fn add_endpoint(&self, location: &Location) -> Arc<MockRemoteService> {
        self.set_reachable(location, true);
        self.service(location)
    }

    /// Bring an endpoint up or down. A down endpoint also fails calls on
    /// connections resolved earlier.
    pub fn set_reachable(&self, location: &Location, reachable: bool) {
        let mut endpoints = self.endpoints.lock();
        let endpoint = Self::endpoint(&mut endpoints, location);
        endpoint.reachable = reachable;
        endpoint.service.set_failing(!reachable);
    }

    /// The service behind `location`, reachable or not.
    pub fn service(&self, location: &Location) -> Arc<MockRemoteService> {
        Self::endpoint(&mut self.endpoints.lock(), location)
            .service
            .clone()
    }

    /// The observer behind `location`, reachable or not.
    pub fn observer(&self, location: &Location) -> Arc<MockObserver> {
        Self::endpoint(&mut self.endpoints.lock(), location)
            .observer
            .clone()
    }

    /// Resolve attempts made for `location`.
    pub fn resolve_count(&self, location: &Location) -> usize {
        self.resolves.lock().get(location).copied().unwrap_or(0)
    }

    fn endpoint<'a>(endpoints: &'a mut HashMap<Location, Endpoint>, location: &Location) -> &'a mut Endpoint {
        endpoints.entry(location.clone()).or_insert_with(|| {
            let service = Arc::new(MockRemoteService::new(location.to_string()));
            service.set_failing(true);
            Endpoint {
                service,
                observer: Arc::new(MockObserver::new()),
                reachable: false,
            }
        })
    }
}

impl Default for MockResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionResolver for MockResolver {
    async fn resolve(&self, location: &Location, service_name: &str) -> Result<ResolvedConnection> {
        *self.resolves.lock().entry(location.clone()).or_default() += 1;

        let endpoints = self.endpoints.lock();
        match endpoints.get(location) {
            Some(endpoint) if endpoint.reachable => Ok(ResolvedConnection {
                service: endpoint.service.clone(),
                observer: endpoint.observer.clone(),
            }),
            _ => Err(Error::Connect {
                location: location.clone(),
                reason: format!("{} not reachable", service_name),
            }),
        }
    }
}

/// A local cache change seen by `RecordingLocalCache`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOp {
    Update(CacheEntry),
    Remove(String),
    RemoveAll,
}

/// Local cache that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingLocalCache {
    ops: Mutex<Vec<LocalOp>>,
}

impl RecordingLocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<LocalOp> {
        self.ops.lock().clone()
    }
}

impl LocalCache for RecordingLocalCache {
    fn local_update(&self, entry: CacheEntry) -> Result<()> {
        self.ops.lock().push(LocalOp::Update(entry));
        Ok(())
    }

    fn local_remove(&self, key: &str) -> Result<bool> {
        self.ops.lock().push(LocalOp::Remove(key.to_string()));
        Ok(true)
    }

    fn local_remove_all(&self) -> Result<()> {
        self.ops.lock().push(LocalOp::RemoveAll);
        Ok(())
    }
}

/// Delivery target recording events as `kind[:key]`, with injectable
/// failures and an optional stall.
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
    failures: AtomicUsize,
    blocked: AtomicBool,
    started: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            blocked: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Delivered events in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Stall every delivery until `unblock`.
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn unblock(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }

    /// Wait until `count` events were delivered.
    pub async fn wait_for(&self, count: usize) {
        wait_until(|| self.events.lock().len() >= count).await
    }

    /// Wait until a delivery was attempted.
    pub async fn wait_started(&self) {
        wait_until(|| self.started.load(Ordering::SeqCst)).await
    }

    async fn handle(&self, event: String) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        while self.blocked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::RemoteIo(format!("{} refused", event)));
        }
        self.events.lock().push(event);
        Ok(())
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheEventHandler for RecordingHandler {
    async fn handle_put(&self, entry: CacheEntry) -> Result<()> {
        self.handle(format!("put:{}", entry.key())).await
    }

    async fn handle_remove(&self, key: &str) -> Result<()> {
        self.handle(format!("remove:{}", key)).await
    }

    async fn handle_remove_all(&self) -> Result<()> {
        self.handle("remove_all".to_string()).await
    }

    async fn handle_dispose(&self) -> Result<()> {
        self.handle("dispose".to_string()).await
    }
}
