use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::Instrument;

use crate::config::CacheConfig;
use crate::deferred::{Deferred, Promise};

/// The outcome of a cache lookup, shared by every caller of the same key.
pub type CacheResult<T, E> = Result<Arc<T>, Arc<E>>;

/// Completion signal of an entry. It is only ever resolved, never rejected.
type Signal = Arc<Deferred<(), Infallible>>;

/// Lifecycle of a cache entry. An entry only ever moves forward through these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryStatus {
    /// The entry exists, but nobody has started populating it yet.
    NotStarted,
    /// A caller is currently running the retrieval for this entry.
    InProgress,
    /// The retrieval has finished, with either a value or an error.
    Done,
}

struct CacheEntry<T, E> {
    status: EntryStatus,
    /// Set exactly once, together with the transition to [`EntryStatus::Done`].
    outcome: Option<CacheResult<T, E>>,
    sequence_id: u64,
    signal: Signal,
}

impl<T, E> CacheEntry<T, E> {
    fn new(sequence_id: u64) -> Self {
        Self {
            status: EntryStatus::NotStarted,
            outcome: None,
            sequence_id,
            signal: Arc::new(Deferred::new()),
        }
    }
}

/// What a caller has to do next, decided while holding the entries lock.
enum Dispatch<T, E> {
    Populate { sequence_id: u64, signal: Signal },
    Wait(Promise<(), Infallible>),
    Finish(Promise<(), Infallible>, CacheResult<T, E>),
}

/// An in-memory cache that coalesces concurrent retrievals of the same key.
///
/// For every key, the retrieval function passed to [`get`](Self::get) runs at most once over the
/// lifetime of the cache. Callers that arrive while it is running wait for it, callers that arrive
/// afterwards are served from memory. Both values and errors are kept forever and handed out as
/// clones of the very same [`Arc`], so a failed key stays failed.
///
/// Entries are never evicted.
pub struct CoalescingCache<K, T, E> {
    config: CacheConfig,
    entries: Mutex<HashMap<K, CacheEntry<T, E>>>,
    next_sequence_id: AtomicU64,
}

impl<K, T, E> CoalescingCache<K, T, E>
where
    K: Eq + Hash + Clone,
{
    /// Creates a new, empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            next_sequence_id: AtomicU64::new(0),
        }
    }

    /// The name of this cache, as configured.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The number of keys this cache has seen, regardless of their status.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no key has been requested yet.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Returns the current status of `key`, or `None` if it was never requested.
    pub fn status(&self, key: &K) -> Option<EntryStatus> {
        self.lock_entries().get(key).map(|entry| entry.status)
    }

    /// Returns the value for `key`, running `retrieve` to produce it if needed.
    ///
    /// Only the first caller for a key has its `retrieve` invoked. Every other caller, whether it
    /// arrives while that retrieval is running or any time after it finished, gets the same value
    /// or the same error, and its own `retrieve` is dropped without being called.
    ///
    /// If the caller that runs `retrieve` is dropped before it finishes, the entry starts over and
    /// one of the waiting callers takes over with its own `retrieve`. A `retrieve` that never
    /// finishes blocks all callers of that key forever.
    pub async fn get<F, Fut>(&self, key: K, retrieve: F) -> CacheResult<T, E>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = self.name();
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut retrieve = Some(retrieve);
        let mut first_dispatch = true;
        let mut joined = false;

        loop {
            let dispatch = {
                let mut entries = self.lock_entries();
                let entries_len = entries.len();
                let entry = entries.entry(key.clone()).or_insert_with(|| {
                    metric!(gauge("caches.entries") = entries_len as u64 + 1, "cache" => name);
                    self.new_entry()
                });

                match entry.status {
                    // The status flips to `InProgress` within the same critical section that
                    // observed `NotStarted`, so only one caller ever gets here per entry.
                    EntryStatus::NotStarted if retrieve.is_some() => {
                        entry.status = EntryStatus::InProgress;
                        Dispatch::Populate {
                            sequence_id: entry.sequence_id,
                            signal: Arc::clone(&entry.signal),
                        }
                    }
                    EntryStatus::NotStarted | EntryStatus::InProgress => {
                        Dispatch::Wait(entry.signal.promise())
                    }
                    EntryStatus::Done => match &entry.outcome {
                        Some(outcome) => {
                            Dispatch::Finish(entry.signal.promise(), outcome.clone())
                        }
                        None => Dispatch::Wait(entry.signal.promise()),
                    },
                }
            };

            match dispatch {
                Dispatch::Populate {
                    sequence_id,
                    signal,
                } => {
                    let Some(retrieve) = retrieve.take() else {
                        continue;
                    };
                    self.populate(&key, sequence_id, retrieve).await;
                    signal.resolve(());
                }
                Dispatch::Wait(signal) => {
                    if !joined {
                        joined = true;
                        metric!(counter("caches.channel.hit") += 1, "cache" => name);
                    }
                    // the signal is never rejected, and the entry keeps its deferred alive
                    signal.await.ok();
                }
                Dispatch::Finish(signal, outcome) => {
                    if first_dispatch {
                        metric!(counter("caches.memory.hit") += 1, "cache" => name);
                    }
                    signal.await.ok();
                    return outcome;
                }
            }

            first_dispatch = false;
        }
    }

    /// Runs `retrieve` and stores its outcome in the entry, which is then `Done`.
    ///
    /// The caller is responsible for resolving the entry's signal afterwards.
    async fn populate<F, Fut>(&self, key: &K, sequence_id: u64, retrieve: F)
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = self.name();
        metric!(counter("caches.computation") += 1, "cache" => name);
        tracing::trace!(cache = name, sequence_id, "populating cache entry");

        let guard = PopulationGuard {
            cache: self,
            key,
            sequence_id,
            done: false,
        };

        let start = Instant::now();
        let span = tracing::trace_span!("cache.retrieve", cache = name, sequence_id);
        let outcome = retrieve(key.clone()).instrument(span).await;
        metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => name);

        let outcome = match outcome {
            Ok(value) => Ok(Arc::new(value)),
            Err(error) => {
                metric!(counter("caches.computation.failed") += 1, "cache" => name);
                Err(Arc::new(error))
            }
        };

        guard.complete(outcome);
    }

    /// Stores the outcome of a finished retrieval and marks the entry as `Done`.
    fn complete(&self, key: &K, sequence_id: u64, outcome: CacheResult<T, E>) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(key) {
            if entry.sequence_id == sequence_id && entry.status == EntryStatus::InProgress {
                entry.outcome = Some(outcome);
                entry.status = EntryStatus::Done;
                tracing::trace!(cache = self.name(), sequence_id, "cache entry done");
            }
        }
    }

    /// Replaces an entry whose population was dropped midway with a fresh one.
    ///
    /// The stale signal is resolved so that everyone waiting on it dispatches again and finds the
    /// new entry, which the first of them will populate.
    fn abandon(&self, key: &K, sequence_id: u64) {
        let stale = {
            let mut entries = self.lock_entries();
            match entries.get_mut(key) {
                Some(entry)
                    if entry.sequence_id == sequence_id
                        && entry.status == EntryStatus::InProgress =>
                {
                    std::mem::replace(entry, self.new_entry())
                }
                _ => return,
            }
        };

        let name = self.name();
        metric!(counter("caches.computation.abandoned") += 1, "cache" => name);
        tracing::debug!(
            cache = name,
            sequence_id,
            "cache population was dropped before it finished, starting over"
        );

        stale.signal.resolve(());
    }

    fn new_entry(&self) -> CacheEntry<T, E> {
        CacheEntry::new(self.next_sequence_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<T, E>>> {
        // Entries are only ever mutated in small, non-panicking critical sections.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, T, E> Default for CoalescingCache<K, T, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<K, T, E> fmt::Debug for CoalescingCache<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.try_lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("CoalescingCache")
            .field("name", &self.config.name)
            .field("entries", &entries)
            .finish()
    }
}

/// Tracks a running population, and starts the entry over if it is dropped before it completes.
struct PopulationGuard<'a, K, T, E>
where
    K: Eq + Hash + Clone,
{
    cache: &'a CoalescingCache<K, T, E>,
    key: &'a K,
    sequence_id: u64,
    done: bool,
}

impl<K, T, E> PopulationGuard<'_, K, T, E>
where
    K: Eq + Hash + Clone,
{
    fn complete(mut self, outcome: CacheResult<T, E>) {
        self.done = true;
        self.cache.complete(self.key, self.sequence_id, outcome);
    }
}

impl<K, T, E> Drop for PopulationGuard<'_, K, T, E>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if !self.done {
            self.cache.abandon(self.key, self.sequence_id);
        }
    }
}
