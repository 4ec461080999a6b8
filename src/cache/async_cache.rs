//! Single-flight, copy-on-write cache used by every metadata cache.
//!
//! Values are stored as immutable `Arc` snapshots and replaced whole. A fetch
//! for a key runs as its own tokio task; callers asking for the same key while
//! it runs await the same shared outcome instead of starting another fetch.

use crate::core::{Result, RoutingError};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Level, event};

/// An immutable cached value together with when it was fetched.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: Arc<V>,
    fetched_at: Instant,
    generation: u64,
}

impl<V> CacheEntry<V> {
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    /// Monotonic per-cache counter of the fetch that produced this entry.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of an age-aware lookup.
#[derive(Debug)]
pub enum CacheLookup<V> {
    /// Present and usable as is.
    Hit(Arc<CacheEntry<V>>),
    /// Present, past its freshness point, still servable.
    Stale(Arc<CacheEntry<V>>),
    /// Absent or too old to serve; the caller has to fetch.
    Miss,
}

pub type FetchOutcome<V> = Result<Arc<CacheEntry<V>>>;

/// Handle on a fetch in progress; every clone resolves to the same outcome.
pub type PendingFetch<V> = Shared<BoxFuture<'static, FetchOutcome<V>>>;

/// Called once with the outcome of every fetch, including detached ones.
pub type FetchObserver<K, V> = Arc<dyn Fn(&K, &FetchOutcome<V>) + Send + Sync>;

struct InFlight<V> {
    generation: u64,
    fetch: PendingFetch<V>,
}

struct Slots<K, V> {
    entries: HashMap<K, Arc<CacheEntry<V>>>,
    /// Generations of fetches detached by `remove` that are still running.
    /// A key is present only while at least one of them is.
    detached: HashMap<K, HashSet<u64>>,
    /// Fetches started below this generation were detached by `clear`.
    floor_all: u64,
}

impl<K: Eq + Hash, V> Slots<K, V> {
    fn accepts(&self, key: &K, generation: u64) -> bool {
        if generation < self.floor_all
            || self
                .detached
                .get(key)
                .is_some_and(|generations| generations.contains(&generation))
        {
            return false;
        }
        self.entries
            .get(key)
            .is_none_or(|existing| existing.generation < generation)
    }

    fn forget_detached(&mut self, key: &K, generation: u64) {
        if let Some(generations) = self.detached.get_mut(key) {
            generations.remove(&generation);
            if generations.is_empty() {
                self.detached.remove(key);
            }
        }
    }
}

/// Counters describing how a cache has been used.
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches_started: AtomicU64,
    fetches_joined: AtomicU64,
    fetch_failures: AtomicU64,
    stale_served: AtomicU64,
}

/// Point-in-time copy of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches_started: u64,
    pub fetches_joined: u64,
    pub fetch_failures: u64,
    pub stale_served: u64,
}

struct CacheState<K, V> {
    name: &'static str,
    fetch_timeout: Duration,
    slots: RwLock<Slots<K, V>>,
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
    next_generation: AtomicU64,
    counters: CacheCounters,
    observer: Option<FetchObserver<K, V>>,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn store(&self, key: &K, value: V, generation: u64) -> Arc<CacheEntry<V>> {
        let entry = Arc::new(CacheEntry {
            value: Arc::new(value),
            fetched_at: Instant::now(),
            generation,
        });
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.accepts(key, generation) {
            slots.entries.insert(key.clone(), Arc::clone(&entry));
        }
        entry
    }

    /// Lock order is `in_flight` then `slots` wherever both are held.
    fn release(&self, key: &K, generation: u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(key)
            .is_some_and(|pending| pending.generation == generation)
        {
            in_flight.remove(key);
        } else {
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .forget_detached(key, generation);
        }
    }
}

/// Concurrency-safe cache of copy-on-write entries with per-key single-flight
/// fetches. Cloning shares the underlying cache.
pub struct AsyncCache<K, V> {
    state: Arc<CacheState<K, V>>,
}

impl<K, V> Clone for AsyncCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, V> AsyncCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty cache. `name` labels log events.
    pub fn new(name: &'static str, fetch_timeout: Duration) -> Self {
        Self::build(name, fetch_timeout, None)
    }

    /// Creates an empty cache that reports every fetch outcome to `observer`.
    pub fn with_observer(
        name: &'static str,
        fetch_timeout: Duration,
        observer: FetchObserver<K, V>,
    ) -> Self {
        Self::build(name, fetch_timeout, Some(observer))
    }

    fn build(
        name: &'static str,
        fetch_timeout: Duration,
        observer: Option<FetchObserver<K, V>>,
    ) -> Self {
        Self {
            state: Arc::new(CacheState {
                name,
                fetch_timeout,
                slots: RwLock::new(Slots {
                    entries: HashMap::new(),
                    detached: HashMap::new(),
                    floor_all: 0,
                }),
                in_flight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                counters: CacheCounters::default(),
                observer,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.state.name
    }

    /// Returns the current snapshot for `key` without waiting on anything.
    pub fn get(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        let slots = self.state.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.entries.get(key).cloned()
    }

    /// Classifies the entry for `key` by age: fresh below `fresh_for`,
    /// stale below `servable_for`, a miss beyond.
    pub fn lookup(&self, key: &K, fresh_for: Duration, servable_for: Duration) -> CacheLookup<V> {
        match self.get(key) {
            Some(entry) if entry.age() < fresh_for => CacheLookup::Hit(entry),
            Some(entry) if entry.age() < servable_for => CacheLookup::Stale(entry),
            _ => CacheLookup::Miss,
        }
    }

    /// Returns the cached entry, or fetches it when absent or when
    /// `force_refresh` is set. Concurrent callers share one fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: K,
        force_refresh: bool,
        fetch: F,
    ) -> Result<Arc<CacheEntry<V>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if !force_refresh {
            if let Some(entry) = self.get(&key) {
                self.record_hit();
                return Ok(entry);
            }
        }
        self.record_miss();
        self.refresh(key, fetch).await
    }

    /// Joins the fetch in progress for `key`, or starts one.
    ///
    /// The fetch runs on the tokio runtime independently of the returned
    /// handle: dropping every handle does not cancel it, and its slot is
    /// released once it finishes or times out. A failed fetch leaves the
    /// previous entry in place.
    pub fn refresh<F, Fut>(&self, key: K, fetch: F) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut in_flight = self
            .state
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = in_flight.get(&key) {
            self.state.counters.fetches_joined.fetch_add(1, Ordering::Relaxed);
            return pending.fetch.clone();
        }

        let generation = self.state.next_generation.fetch_add(1, Ordering::SeqCst);
        self.state.counters.fetches_started.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::DEBUG,
            cache = self.state.name,
            key = ?key,
            generation,
            "starting metadata fetch"
        );

        let state = Arc::clone(&self.state);
        let task_key = key.clone();
        let work = fetch();
        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(state.fetch_timeout, work).await {
                Ok(Ok(value)) => Ok(state.store(&task_key, value, generation)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(RoutingError::TransientFetchFailure(format!(
                    "{} fetch for {:?} timed out after {:?}",
                    state.name, task_key, state.fetch_timeout
                ))),
            };
            if let Err(err) = &outcome {
                state.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::WARN,
                    cache = state.name,
                    key = ?task_key,
                    error = %err,
                    "metadata fetch failed"
                );
            }
            if let Some(observer) = &state.observer {
                observer(&task_key, &outcome);
            }
            state.release(&task_key, generation);
            outcome
        });

        let name = self.state.name;
        let fetch = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(RoutingError::TransientFetchFailure(format!(
                    "{} fetch task failed: {}",
                    name, join_err
                ))),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            key,
            InFlight {
                generation,
                fetch: fetch.clone(),
            },
        );
        fetch
    }

    /// Drops the entry for `key` and detaches any fetch in progress for it, so
    /// the next caller starts a fresh fetch and the detached one cannot
    /// repopulate the entry.
    pub fn remove(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        let mut in_flight = self
            .state
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pending = in_flight.remove(key);
        let mut slots = self.state.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = pending {
            slots
                .detached
                .entry(key.clone())
                .or_default()
                .insert(pending.generation);
        }
        slots.entries.remove(key)
    }

    /// Drops every entry matching `predicate`.
    pub fn remove_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let keys: Vec<K> = {
            let slots = self.state.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.entries.keys().filter(|key| predicate(key)).cloned().collect()
        };
        keys.iter().filter(|key| self.remove(key).is_some()).count()
    }

    /// Drops every entry and detaches every fetch in progress.
    pub fn clear(&self) {
        let mut in_flight = self
            .state
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.clear();
        let mut slots = self.state.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.entries.clear();
        slots.detached.clear();
        slots.floor_all = self.state.next_generation.load(Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a fetch for `key` is running.
    pub fn is_fetching(&self, key: &K) -> bool {
        self.state
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub(crate) fn record_hit(&self) {
        self.state.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.state.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_served(&self) {
        self.state.counters.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.state.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            fetches_started: counters.fetches_started.load(Ordering::Relaxed),
            fetches_joined: counters.fetches_joined.load(Ordering::Relaxed),
            fetch_failures: counters.fetch_failures.load(Ordering::Relaxed),
            stale_served: counters.stale_served.load(Ordering::Relaxed),
        }
    }
}
