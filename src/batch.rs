//! The shared batch state machine.
//!
//! A batch collects keys while its schedule runs, then makes one backend
//! call and distributes the results positionally to the thunks that were
//! appended alongside the keys. There is no dedicated task per batch: the
//! readers awaiting the batch's thunks drive it from their own polls, and
//! the waker bookkeeping guarantees that dropping the currently driving
//! reader hands the job to another one.

use std::{
    future::Future,
    mem,
    pin::Pin,
    ptr,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use tokio_util::sync::CancellationToken;

use crate::{
    loader::Hook,
    schedule::BatchSignals,
    thunk::Thunk,
    wakerset::{WakerSet, WakerToken},
};

/// The backend of a loader.
///
/// Invoked once per dispatched batch with the loader's construction token
/// and the batch's keys, in insertion order. The returned results must
/// correspond positionally to the keys, one result per key. Returning a
/// different number of results is a contract violation: surplus results are
/// discarded, and readers of keys that received no result are never
/// resolved.
///
/// Plain functions and closures
/// `Fn(&CancellationToken, &[K]) -> impl Future<Output = Vec<Result<V, E>>>`
/// can be used directly as backends.
pub trait BatchFn<K, V, E> {
    type Fut: Future<Output = Vec<Result<V, E>>>;

    fn load(&self, ctx: &CancellationToken, keys: &[K]) -> Self::Fut;
}

impl<F, Fut, K, V, E> BatchFn<K, V, E> for F
where
    F: Fn(&CancellationToken, &[K]) -> Fut,
    Fut: Future<Output = Vec<Result<V, E>>>,
{
    type Fut = Fut;

    fn load(&self, ctx: &CancellationToken, keys: &[K]) -> Fut {
        self(ctx, keys)
    }
}

/// Access to the machinery that will eventually resolve a thunk.
///
/// Readers of an unresolved thunk call [`Drive::drive`] from their polls;
/// the token bookkeeping keeps exactly one task responsible for progress
/// while allowing any registered reader to take over.
pub(crate) trait Drive: Send + Sync {
    fn drive(&self, cx: &mut Context<'_>, token: &mut Option<WakerToken>);

    /// A reader gives up its registration because it was dropped or
    /// cancelled. If it was the driving task, another reader is woken to
    /// take over.
    fn resign(&self, token: WakerToken);
}

/// The loader's list of not-yet-dispatched batches. The open batch, if any,
/// is the last element.
pub(crate) type Roster<K, V, E, B, W> = Mutex<Vec<Arc<BatchCore<K, V, E, B, W>>>>;

pub(crate) struct BatchCore<K, V, E, B: BatchFn<K, V, E>, W> {
    token: CancellationToken,
    batch_fn: B,
    hook: Option<Arc<dyn Hook<K, V, E>>>,
    signals: BatchSignals,
    roster: Weak<Roster<K, V, E, B, W>>,
    phase: Mutex<Phase<K, V, E, B::Fut, W>>,
}

enum Phase<K, V, E, Fut, W> {
    /// Accumulating keys; `wait` is this batch's schedule future.
    Open {
        keys: Vec<K>,
        thunks: Vec<Thunk<V, E>>,
        wait: W,
        wakers: WakerSet,
    },
    /// The backend call is in flight.
    Loading {
        keys: Vec<K>,
        thunks: Vec<Thunk<V, E>>,
        fut: Fut,
        wakers: WakerSet,
    },
    /// Results have been distributed.
    Finished,
}

impl<K, V, E, B, W> BatchCore<K, V, E, B, W>
where
    B: BatchFn<K, V, E>,
{
    pub(crate) fn open(
        token: CancellationToken,
        batch_fn: B,
        hook: Option<Arc<dyn Hook<K, V, E>>>,
        signals: BatchSignals,
        roster: &Arc<Roster<K, V, E, B, W>>,
        wait: W,
    ) -> Self {
        Self {
            token,
            batch_fn,
            hook,
            signals,
            roster: Arc::downgrade(roster),
            phase: Mutex::new(Phase::Open {
                keys: Vec::new(),
                thunks: Vec::new(),
                wait,
                wakers: WakerSet::new(),
            }),
        }
    }

    pub(crate) fn signals(&self) -> &BatchSignals {
        &self.signals
    }

    /// Number of keys accumulated so far. Listed batches are always open;
    /// dispatch removes a batch from the roster before it transitions.
    pub(crate) fn size(&self) -> usize {
        match &*self.phase.lock().unwrap() {
            Phase::Open { keys, .. } => keys.len(),
            _ => panic!("sized a batch that already dispatched"),
        }
    }

    /// Append one key/thunk pair and return the new size.
    pub(crate) fn append(&self, key: K, thunk: Thunk<V, E>) -> usize {
        match &mut *self.phase.lock().unwrap() {
            Phase::Open { keys, thunks, .. } => {
                keys.push(key);
                thunks.push(thunk);
                keys.len()
            }
            _ => panic!("appended to a batch that already dispatched"),
        }
    }

    /// Remove this batch from its loader's roster. Returns whether this
    /// call performed the removal; the winner runs the dispatch, so the
    /// backend is invoked exactly once per batch.
    fn unlist(&self) -> bool {
        let roster = match self.roster.upgrade() {
            Some(roster) => roster,
            // The loader is gone, so nothing can race the claim.
            None => return true,
        };
        let mut listed = roster.lock().unwrap();
        match listed
            .iter()
            .position(|batch| ptr::eq(Arc::as_ptr(batch), self as *const _))
        {
            Some(index) => {
                listed.remove(index);
                true
            }
            None => false,
        }
    }
}

impl<K, V, E, B, W> Drive for BatchCore<K, V, E, B, W>
where
    K: Send,
    V: Clone + Send,
    E: Clone + Send,
    B: BatchFn<K, V, E> + Send + Sync,
    B::Fut: Send,
    W: Future<Output = ()> + Send,
{
    fn drive(&self, cx: &mut Context<'_>, token: &mut Option<WakerToken>) {
        // This lock is only held for the duration of a poll, never across
        // an await. A panic in the schedule or the backend poisons it,
        // which propagates the panic to every other reader.
        let mut phase = self.phase.lock().unwrap();

        // Wait out the schedule.
        if let Phase::Open { wait, wakers, .. } = &mut *phase {
            // A cancelled loader never flushes; its readers resolve only
            // through their own tokens.
            if self.token.is_cancelled() {
                return;
            }

            // Safety: `wait` lives behind the Arc'd mutex and is never
            // moved; the transition below destructs it in place.
            let wait = unsafe { Pin::new_unchecked(wait) };
            if wait.poll(cx).is_pending() {
                wakers.register(cx.waker(), token);
                return;
            }
        }

        // The schedule fired: claim the batch and launch the backend call.
        if matches!(*phase, Phase::Open { .. }) {
            // The roster lock is ordered before the phase lock, so release
            // the phase for the claim and re-acquire it afterwards. Keys
            // appended in the gap simply ride along with the dispatch.
            drop(phase);
            let claimed = self.unlist();
            phase = self.phase.lock().unwrap();

            if claimed {
                if let Phase::Open {
                    keys,
                    thunks,
                    wakers,
                    ..
                } = &mut *phase
                {
                    let keys = mem::take(keys);
                    let thunks = mem::take(thunks);
                    let wakers = mem::take(wakers);

                    tracing::debug!(keys = keys.len(), "dispatching batch");
                    if let Some(hook) = &self.hook {
                        hook.before_batch(&self.token, &keys);
                    }
                    let fut = self.batch_fn.load(&self.token, &keys);

                    // The schedule future is destructed in place by this
                    // assignment, upholding the pin contract.
                    *phase = Phase::Loading {
                        keys,
                        thunks,
                        fut,
                        wakers,
                    };
                }
            } else if let Phase::Open { wakers, .. } = &mut *phase {
                // Lost the claim; the winner carries this registration into
                // the loading phase and wakes it on completion.
                wakers.register(cx.waker(), token);
                return;
            }
        }

        // Poll the backend call.
        let mut completed = None;
        if let Phase::Loading { fut, wakers, .. } = &mut *phase {
            // Safety: `fut` is never moved out of the mutex; the transition
            // below destructs it in place.
            let fut = unsafe { Pin::new_unchecked(fut) };
            match fut.poll(cx) {
                Poll::Pending => {
                    wakers.register(cx.waker(), token);
                    return;
                }
                Poll::Ready(results) => completed = Some(results),
            }
        }

        // Distribute results positionally and wake every reader.
        if let Some(results) = completed {
            if let Phase::Loading {
                keys,
                thunks,
                wakers,
                ..
            } = &mut *phase
            {
                let keys = mem::take(keys);
                let thunks = mem::take(thunks);
                let wakers = mem::take(wakers);

                // The backend future is destructed in place here.
                *phase = Phase::Finished;
                drop(phase);

                debug_assert_eq!(
                    results.len(),
                    thunks.len(),
                    "backend returned a result count that does not match the key count",
                );
                if results.len() != thunks.len() {
                    tracing::error!(
                        keys = thunks.len(),
                        results = results.len(),
                        "backend result count does not match key count",
                    );
                }

                for (thunk, result) in thunks.iter().zip(&results) {
                    match result {
                        Ok(value) => thunk.fill(value.clone()),
                        Err(error) => thunk.fail(error.clone()),
                    }
                }
                if let Some(hook) = &self.hook {
                    hook.after_batch(&self.token, &keys, &results);
                }
                wakers.wake_all();
            }
        }
    }

    fn resign(&self, token: WakerToken) {
        // Tolerate a poisoned lock here: resign runs from reader drops, and
        // the panic that poisoned the phase is already propagating.
        if let Ok(mut phase) = self.phase.lock() {
            match &mut *phase {
                Phase::Open { wakers, .. } | Phase::Loading { wakers, .. } => {
                    wakers.discard_and_promote(token);
                }
                Phase::Finished => {}
            }
        }
    }
}
