//! One-shot broadcast flags used as a batch's *full* and *dispatch* signals.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use crate::wakerset::{WakerSet, WakerToken};

/// A flag that can be fired at most once and observed by any number of
/// waiters, either synchronously or as a future.
#[derive(Clone, Debug, Default)]
pub(crate) struct Signal {
    inner: Arc<Mutex<SignalInner>>,
}

#[derive(Debug, Default)]
struct SignalInner {
    fired: bool,
    wakers: WakerSet,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent; only the first call wakes waiters.
    pub fn fire(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.fired {
            inner.fired = true;
            inner.wakers.wake_all();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.lock().unwrap().fired
    }

    /// A future resolving once the signal has fired. Resolves immediately if
    /// it already has.
    pub fn fired(&self) -> Fired {
        Fired {
            signal: self.clone(),
            token: None,
        }
    }
}

/// Waits for a [`Signal`] to fire. Returned by [`BatchSignals::full`] and
/// [`BatchSignals::dispatched`].
///
/// [`BatchSignals::full`]: crate::BatchSignals::full
/// [`BatchSignals::dispatched`]: crate::BatchSignals::dispatched
#[derive(Debug)]
pub struct Fired {
    signal: Signal,
    token: Option<WakerToken>,
}

impl Future for Fired {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);
        let mut inner = this.signal.inner.lock().unwrap();
        if inner.fired {
            if let Some(token) = this.token.take() {
                inner.wakers.discard(token);
            }
            Poll::Ready(())
        } else {
            inner.wakers.register(cx.waker(), &mut this.token);
            Poll::Pending
        }
    }
}

impl Drop for Fired {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Ok(mut inner) = self.signal.inner.lock() {
                inner.wakers.discard(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cooked_waker::{IntoWaker, Wake, WakeRef};
    use std::sync::atomic::{AtomicBool, Ordering};

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
    fn resolves_immediately_after_fire() {
        let signal = Signal::new();
        signal.fire();
        assert!(signal.is_fired());
        futures::executor::block_on(signal.fired());
    }

    #[test]
    fn fire_wakes_a_parked_waiter() {
        let signal = Signal::new();
        let bell = BoolWaker::default();
        let waker = Arc::new(bell.clone()).into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = signal.fired();
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        assert!(!bell.is_signaled());

        signal.fire();
        assert!(bell.is_signaled());
        assert!(Pin::new(&mut wait).poll(&mut cx).is_ready());
    }

    #[test]
    fn second_fire_is_inert() {
        let signal = Signal::new();
        signal.fire();

        let bell = BoolWaker::default();
        let waker = Arc::new(bell.clone()).into_waker();
        let mut cx = Context::from_waker(&waker);

        // A fired signal never re-registers, so a repeat fire has no one to
        // wake and nothing to change.
        let mut wait = signal.fired();
        assert!(Pin::new(&mut wait).poll(&mut cx).is_ready());
        signal.fire();
        assert!(!bell.is_signaled());
    }
}
