//! The pending-result cell shared between a loader and its callers.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    batch::Drive,
    wakerset::{WakerSet, WakerToken},
};

/// Why a [`Get`] resolved without a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError<E> {
    /// The reader's own cancellation token fired before a result arrived.
    /// Other readers and the batch itself are unaffected.
    #[error("wait was cancelled before a result arrived")]
    Cancelled,
    /// The load itself failed: a key could not be fingerprinted, the cache
    /// refused the entry, or the backend reported an error for this key.
    #[error("load failed: {0}")]
    Failed(E),
}

/// A single-slot cell holding the eventual value (or error) for one key.
///
/// Cloning a `Thunk` clones a handle to the same cell; the loader keeps one
/// clone in its cache and hands another to every caller. Any number of
/// readers may wait via [`Thunk::get`], before or after the cell resolves,
/// and all of them observe the same result.
///
/// Writes are not single-assignment: a later write replaces an earlier one,
/// and readers that have not yet observed the first value may see either.
/// Readers that already returned keep what they saw.
pub struct Thunk<V, E> {
    inner: Arc<Mutex<ThunkInner<V, E>>>,
}

impl<V, E> Clone for Thunk<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Debug, E: Debug> Debug for Thunk<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Thunk")
            .field("slot", &inner.slot)
            .finish_non_exhaustive()
    }
}

struct ThunkInner<V, E> {
    slot: Option<Result<V, E>>,
    wakers: WakerSet,
    // Present while an undispatched batch owns this thunk; lets readers
    // that arrived through a cache hit push that batch forward.
    driver: Option<Arc<dyn Drive>>,
}

impl<V, E> Thunk<V, E> {
    /// An unresolved cell.
    pub(crate) fn new() -> Self {
        Self::with_slot(None)
    }

    /// A cell born resolved, as produced by `prime`.
    pub(crate) fn ready(value: V) -> Self {
        Self::with_slot(Some(Ok(value)))
    }

    /// A cell born failed, as produced by fingerprint and cache errors.
    pub(crate) fn rejected(error: E) -> Self {
        Self::with_slot(Some(Err(error)))
    }

    fn with_slot(slot: Option<Result<V, E>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ThunkInner {
                slot,
                wakers: WakerSet::new(),
                driver: None,
            })),
        }
    }

    pub(crate) fn attach_driver(&self, driver: Arc<dyn Drive>) {
        self.inner.lock().unwrap().driver = Some(driver);
    }

    /// Store a value, replacing whatever the slot held, and wake every
    /// waiting reader.
    pub(crate) fn fill(&self, value: V) {
        self.settle(Ok(value));
    }

    /// Store an error, replacing whatever the slot held, and wake every
    /// waiting reader.
    pub(crate) fn fail(&self, error: E) {
        self.settle(Err(error));
    }

    fn settle(&self, result: Result<V, E>) {
        let mut inner = self.inner.lock().unwrap();
        inner.slot = Some(result);
        inner.driver = None;
        inner.wakers.wake_all();
    }

    /// Begin a wait on this cell. The returned future resolves with the
    /// stored value or error, or with [`LoadError::Cancelled`] if `ctx` is
    /// cancelled first. Waits taken after resolution complete immediately.
    pub fn get(&self, ctx: &CancellationToken) -> Get<V, E> {
        Get {
            thunk: self.clone(),
            cancelled: ctx.clone().cancelled_owned(),
            waker_token: None,
            drive_token: None,
            done: false,
        }
    }
}

/// One reader's wait on a [`Thunk`]. Created by [`Thunk::get`].
///
/// While the thunk is unresolved, polling this future also pushes the
/// thunk's batch forward, so batches make progress as long as at least one
/// reader is being awaited.
pub struct Get<V, E> {
    thunk: Thunk<V, E>,
    cancelled: WaitForCancellationFutureOwned,
    waker_token: Option<WakerToken>,
    drive_token: Option<WakerToken>,
    done: bool,
}

impl<V, E> Future for Get<V, E>
where
    V: Clone,
    E: Clone,
{
    type Output = Result<V, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: nothing is moved out of `this`. The `cancelled` field is
        // structurally pinned: it is only polled through the re-pin below
        // and is dropped in place with the Get.
        let this = unsafe { self.get_unchecked_mut() };

        assert!(!this.done, "polled a completed Get");

        let driver = {
            let mut inner = this.thunk.inner.lock().unwrap();
            if let Some(result) = &inner.slot {
                let result = result.clone();
                if let Some(token) = this.waker_token.take() {
                    inner.wakers.discard(token);
                }
                this.done = true;
                return Poll::Ready(result.map_err(LoadError::Failed));
            }
            // Park for the fill broadcast before anything else, so a fill
            // that lands while this poll drives the batch still wakes us.
            inner.wakers.register(cx.waker(), &mut this.waker_token);
            inner.driver.clone()
        };

        // A cancelled reader resolves on its own; the batch keeps running
        // for everyone else.
        // Safety: `cancelled` is pinned through `this`, which is pinned.
        let cancelled = unsafe { Pin::new_unchecked(&mut this.cancelled) };
        if cancelled.poll(cx).is_ready() {
            let driver = {
                let mut inner = this.thunk.inner.lock().unwrap();
                if let Some(token) = this.waker_token.take() {
                    inner.wakers.discard(token);
                }
                inner.driver.clone()
            };
            // If this reader was driving the batch, hand the role off.
            if let (Some(driver), Some(token)) = (driver, this.drive_token.take()) {
                driver.resign(token);
            }
            this.done = true;
            return Poll::Ready(Err(LoadError::Cancelled));
        }

        if let Some(driver) = driver {
            driver.drive(cx, &mut this.drive_token);

            // Driving may have completed the batch within this very poll.
            let mut inner = this.thunk.inner.lock().unwrap();
            if let Some(result) = &inner.slot {
                let result = result.clone();
                if let Some(token) = this.waker_token.take() {
                    inner.wakers.discard(token);
                }
                this.done = true;
                return Poll::Ready(result.map_err(LoadError::Failed));
            }
        }

        Poll::Pending
    }
}

impl<V, E> Drop for Get<V, E> {
    fn drop(&mut self) {
        // Skip cleanup if the mutex is poisoned; the panic that poisoned it
        // is already propagating through the other readers.
        let driver = match self.thunk.inner.lock() {
            Ok(mut inner) => {
                if let Some(token) = self.waker_token.take() {
                    inner.wakers.discard(token);
                }
                inner.driver.clone()
            }
            Err(_) => return,
        };
        // Dropping the driving reader must wake a replacement, or the batch
        // would stall with every remaining reader parked.
        if let (Some(driver), Some(token)) = (driver, self.drive_token.take()) {
            driver.resign(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cooked_waker::{IntoWaker, Wake, WakeRef};
    use futures::executor;
    use std::sync::atomic::{AtomicBool, Ordering};

    type TestThunk = Thunk<String, &'static str>;

    #[derive(Debug, Clone, Default)]
    struct BoolWaker {
        cell: Arc<AtomicBool>,
    }

    impl BoolWaker {
        fn is_signaled(&self) -> bool {
            self.cell.load(Ordering::SeqCst)
        }
    }

    impl WakeRef for BoolWaker {
        fn wake_by_ref(&self) {
            self.cell.store(true, Ordering::SeqCst);
        }
    }

    impl Wake for BoolWaker {}

    #[test]
    fn get_after_fill_resolves_immediately() {
        let thunk = TestThunk::new();
        thunk.fill("foo".to_string());

        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Ok("foo".to_string())
        );
    }

    #[test]
    fn get_after_fail_resolves_immediately() {
        let thunk = TestThunk::new();
        thunk.fail("bar");

        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Err(LoadError::Failed("bar"))
        );
    }

    #[test]
    fn fill_wakes_a_parked_reader() {
        let thunk = TestThunk::new();
        let token = CancellationToken::new();

        let bell = BoolWaker::default();
        let waker = Arc::new(bell.clone()).into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = Box::pin(thunk.get(&token));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert!(!bell.is_signaled());

        thunk.fill("foo".to_string());
        assert!(bell.is_signaled());
        assert_eq!(
            wait.as_mut().poll(&mut cx),
            Poll::Ready(Ok("foo".to_string()))
        );
    }

    #[test]
    fn fail_wakes_a_parked_reader() {
        let thunk = TestThunk::new();
        let token = CancellationToken::new();

        let bell = BoolWaker::default();
        let waker = Arc::new(bell.clone()).into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = Box::pin(thunk.get(&token));
        assert!(wait.as_mut().poll(&mut cx).is_pending());

        thunk.fail("bar");
        assert!(bell.is_signaled());
        assert_eq!(
            wait.as_mut().poll(&mut cx),
            Poll::Ready(Err(LoadError::Failed("bar")))
        );
    }

    #[test]
    fn every_reader_sees_the_same_value() {
        let thunk = TestThunk::new();
        let token = CancellationToken::new();

        let bell = BoolWaker::default();
        let waker = Arc::new(bell.clone()).into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut early = Box::pin(thunk.get(&token));
        assert!(early.as_mut().poll(&mut cx).is_pending());

        thunk.fill("foo".to_string());

        let late = thunk.get(&token);
        assert_eq!(
            early.as_mut().poll(&mut cx),
            Poll::Ready(Ok("foo".to_string()))
        );
        assert_eq!(executor::block_on(late), Ok("foo".to_string()));
    }

    #[test]
    fn every_reader_sees_the_same_error() {
        let thunk = TestThunk::new();
        let token = CancellationToken::new();

        thunk.fail("bar");

        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Err(LoadError::Failed("bar"))
        );
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Err(LoadError::Failed("bar"))
        );
    }

    // The cell deliberately allows later writes to replace earlier ones;
    // readers waiting at override time see the latest write.

    #[test]
    fn value_overrides_value() {
        let thunk = TestThunk::new();
        thunk.fill("bar".to_string());
        thunk.fill("foo".to_string());

        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Ok("foo".to_string())
        );
    }

    #[test]
    fn error_overrides_value() {
        let thunk = TestThunk::new();
        thunk.fill("bar".to_string());
        thunk.fail("foo");

        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Err(LoadError::Failed("foo"))
        );
    }

    #[test]
    fn value_overrides_error() {
        let thunk = TestThunk::new();
        thunk.fail("bar");
        thunk.fill("foo".to_string());

        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Ok("foo".to_string())
        );
    }

    #[test]
    fn error_overrides_error() {
        let thunk = TestThunk::new();
        thunk.fail("bar");
        thunk.fail("foo");

        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Err(LoadError::Failed("foo"))
        );
    }

    #[test]
    fn cancelled_token_resolves_the_wait() {
        let thunk = TestThunk::new();
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Err(LoadError::Cancelled)
        );
    }

    #[test]
    fn cancellation_wakes_a_parked_reader() {
        let thunk = TestThunk::new();
        let token = CancellationToken::new();

        let bell = BoolWaker::default();
        let waker = Arc::new(bell.clone()).into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = Box::pin(thunk.get(&token));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert!(!bell.is_signaled());

        token.cancel();
        assert!(bell.is_signaled());
        assert_eq!(
            wait.as_mut().poll(&mut cx),
            Poll::Ready(Err(LoadError::Cancelled))
        );
    }

    #[test]
    fn cancellation_does_not_disturb_other_readers() {
        let thunk = TestThunk::new();
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        assert_eq!(
            executor::block_on(thunk.get(&cancelled)),
            Err(LoadError::Cancelled)
        );

        thunk.fill("foo".to_string());
        let token = CancellationToken::new();
        assert_eq!(
            executor::block_on(thunk.get(&token)),
            Ok("foo".to_string())
        );
    }
}
