//! The loader facade gluing cache, batches, and schedule together.

use std::{
    hash::Hash,
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

use crate::{
    batch::{BatchCore, BatchFn, Drive, Roster},
    cache::{CacheMap, InMemoryCache},
    key::{KeyFingerprint, MirrorKey},
    schedule::{BatchSignals, DispatchSchedule, TimeWindow},
    thunk::Thunk,
};

/// Default capacity of a single batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Observer for batch execution. Both methods receive the loader's
/// construction token, the same one the backend is invoked with.
pub trait Hook<K, V, E>: Send + Sync {
    /// Called just before the backend runs, with the keys about to load.
    fn before_batch(&self, _ctx: &CancellationToken, _keys: &[K]) {}

    /// Called after the backend returned, with the same keys and its
    /// results.
    fn after_batch(&self, _ctx: &CancellationToken, _keys: &[K], _results: &[Result<V, E>]) {}
}

/// Construction-time configuration of a [`Loader`]. None of these knobs can
/// be changed after construction.
///
/// Custom stacks are built as plain struct literals:
///
/// ```ignore
/// let rules = LoaderRules {
///     batch_fn,
///     schedule: TimeWindow::new(Duration::from_millis(5)),
///     key_fn: MirrorKey,
///     cache: NoCache,
///     max_batch_size: 50,
///     hook: None,
/// };
/// let loader = Loader::with_rules(token, rules);
/// ```
pub struct LoaderRules<K, V, E, B, S, F, M> {
    /// The backend batch function.
    pub batch_fn: B,
    /// When each batch flushes.
    pub schedule: S,
    /// How user keys become cache keys.
    pub key_fn: F,
    /// Where thunks are remembered.
    pub cache: M,
    /// Capacity of one batch. Zero disables coalescing entirely: every load
    /// opens a batch that is immediately full.
    pub max_batch_size: usize,
    /// Optional observer around backend calls.
    pub hook: Option<Arc<dyn Hook<K, V, E>>>,
}

/// The rules produced by [`LoaderRules::new`]: time-window schedule, identity
/// key fingerprint, unbounded in-memory cache.
pub type DefaultRules<K, V, E, B> =
    LoaderRules<K, V, E, B, TimeWindow, MirrorKey, InMemoryCache<K, Thunk<V, E>>>;

impl<K, V, E, B> DefaultRules<K, V, E, B> {
    /// Rules with the stock stack and a batch capacity of
    /// [`DEFAULT_MAX_BATCH_SIZE`].
    pub fn new(batch_fn: B) -> Self {
        Self {
            batch_fn,
            schedule: TimeWindow::default(),
            key_fn: MirrorKey,
            cache: InMemoryCache::new(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            hook: None,
        }
    }
}

impl<K, V, E, B, S, F, M> LoaderRules<K, V, E, B, S, F, M> {
    /// Disabling batching caps every batch at a single key, so each load
    /// dispatches on its own.
    pub fn batching(mut self, enabled: bool) -> Self {
        if !enabled {
            self.max_batch_size = 1;
        }
        self
    }

    /// Install an observer around backend calls.
    pub fn hook(mut self, hook: Arc<dyn Hook<K, V, E>>) -> Self {
        self.hook = Some(hook);
        self
    }
}

/// A request-coalescing batch loader.
///
/// Identical concurrent loads share one in-flight result, and distinct keys
/// requested within the schedule's window are folded into a single backend
/// batch call. Loads return a [`Thunk`]; awaiting it (via [`Thunk::get`])
/// is what pushes the underlying batch forward, so no executor or spawner
/// is required.
///
/// The loader is `Sync`: share it by reference between threads or tasks.
pub struct Loader<K, V, E, B, S, F, M>
where
    B: BatchFn<K, V, E>,
    S: DispatchSchedule,
{
    token: CancellationToken,
    batch_fn: B,
    schedule: S,
    key_fn: F,
    max_batch_size: usize,
    hook: Option<Arc<dyn Hook<K, V, E>>>,
    cache: Mutex<M>,
    roster: Arc<Roster<K, V, E, B, S::Wait>>,
}

impl<K, V, E, B> Loader<K, V, E, B, TimeWindow, MirrorKey, InMemoryCache<K, Thunk<V, E>>>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    B: BatchFn<K, V, E> + Clone + Send + Sync + 'static,
    B::Fut: Send + 'static,
{
    /// A loader with the stock configuration: 16 ms time-window schedule,
    /// identity key fingerprint, unbounded in-memory cache, batches of up
    /// to [`DEFAULT_MAX_BATCH_SIZE`] keys.
    ///
    /// Cancelling `token` stops every future flush; see [`Loader::dispatch`]
    /// and the crate docs for the consequences.
    pub fn new(token: CancellationToken, batch_fn: B) -> Self {
        Self::with_rules(token, LoaderRules::new(batch_fn))
    }
}

impl<K, V, E, B, S, F, M> Loader<K, V, E, B, S, F, M>
where
    K: Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    B: BatchFn<K, V, E> + Clone + Send + Sync + 'static,
    B::Fut: Send + 'static,
    S: DispatchSchedule,
    S::Wait: Send + 'static,
    F: KeyFingerprint<K, E>,
    M: CacheMap<F::CacheKey, Thunk<V, E>, E>,
{
    pub fn with_rules(token: CancellationToken, rules: LoaderRules<K, V, E, B, S, F, M>) -> Self {
        Self {
            token,
            batch_fn: rules.batch_fn,
            schedule: rules.schedule,
            key_fn: rules.key_fn,
            max_batch_size: rules.max_batch_size,
            hook: rules.hook,
            cache: Mutex::new(rules.cache),
            roster: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Request the value for `key`.
    ///
    /// On a cache hit the cached thunk is returned as is, resolved or not;
    /// concurrent loads of one key therefore share a single in-flight
    /// result. On a miss the key joins the open batch (opening one if
    /// needed) and a fresh thunk is cached and returned. Fingerprint and
    /// cache failures come back as already-failed thunks.
    pub fn load(&self, key: K) -> Thunk<V, E> {
        let cache_key = match self.key_fn.fingerprint(&key) {
            Ok(cache_key) => cache_key,
            Err(err) => return Thunk::rejected(err),
        };

        // The roster lock spans the cache probe and the append, which is
        // what makes get-miss-put-append atomic against other loads.
        let mut listed = self.roster.lock().unwrap();

        let thunk = {
            let mut cache = self.cache.lock().unwrap();
            match cache.get(&cache_key) {
                Ok(Some(cached)) => {
                    tracing::trace!("load joined an existing thunk");
                    return cached;
                }
                Ok(None) => {}
                Err(err) => return Thunk::rejected(err),
            }

            let thunk = Thunk::new();
            if let Err(err) = cache.put(cache_key, thunk.clone()) {
                return Thunk::rejected(err);
            }
            thunk
        };

        let needs_new = match listed.last() {
            Some(last) => last.size() >= self.max_batch_size,
            None => true,
        };
        if needs_new {
            let signals = BatchSignals::new();
            let wait = self.schedule.begin(signals.clone());
            listed.push(Arc::new(BatchCore::open(
                self.token.clone(),
                self.batch_fn.clone(),
                self.hook.clone(),
                signals,
                &self.roster,
                wait,
            )));
        }

        let open = Arc::clone(listed.last().expect("no open batch after load"));
        let size = open.append(key, thunk.clone());
        let driver: Arc<dyn Drive> = open.clone() as Arc<dyn Drive>;
        thunk.attach_driver(driver);
        if size >= self.max_batch_size {
            open.signals().fire_full();
        }

        thunk
    }

    /// [`Loader::load`] for each key; the returned thunks match the input
    /// order, and all the keys share a batch while capacity permits.
    pub fn load_many<I>(&self, keys: I) -> Vec<Thunk<V, E>>
    where
        I: IntoIterator<Item = K>,
    {
        keys.into_iter().map(|key| self.load(key)).collect()
    }

    /// Drop the cache entry for `key`, so the next load reaches the
    /// backend again. Cache failures are not surfaced; a key that cannot
    /// be fingerprinted is left alone.
    pub fn clear(&self, key: &K) -> &Self {
        if let Ok(cache_key) = self.key_fn.fingerprint(key) {
            let _ = self.cache.lock().unwrap().delete(&cache_key);
        }
        self
    }

    /// Drop every cache entry. Cache failures are not surfaced.
    pub fn clear_all(&self) -> &Self {
        let _ = self.cache.lock().unwrap().clear();
        self
    }

    /// Install an already-resolved entry for `key`, replacing any existing
    /// entry. Readers already waiting on a previous entry keep waiting for
    /// the batch path; only subsequent loads observe the primed value.
    pub fn prime(&self, key: &K, value: V) -> &Self {
        if let Ok(cache_key) = self.key_fn.fingerprint(key) {
            let _ = self
                .cache
                .lock()
                .unwrap()
                .put(cache_key, Thunk::ready(value));
        }
        self
    }

    /// Ask every batch still waiting on its schedule to flush now. Batches
    /// already full or already asked are left alone, so repeated calls are
    /// harmless; an empty loader is a no-op.
    pub fn dispatch(&self) {
        let listed = self.roster.lock().unwrap();
        for batch in listed.iter() {
            let signals = batch.signals();
            if !signals.full_fired() && !signals.dispatch_fired() {
                signals.fire_dispatch();
            }
        }
    }
}
