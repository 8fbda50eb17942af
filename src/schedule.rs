//! Decides when an open batch stops accumulating and flushes.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_timer::Delay;

use crate::signal::{Fired, Signal};

/// Default quiescence window of [`TimeWindow`].
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(16);

/// Read-only handles to one batch's flush triggers.
///
/// The *full* signal fires at most once, when the batch reaches its
/// configured capacity. The *dispatch* signal fires at most once, when a
/// manual [`Loader::dispatch`] asks for a flush. A schedule races these
/// against any trigger of its own.
///
/// [`Loader::dispatch`]: crate::Loader::dispatch
#[derive(Clone, Debug)]
pub struct BatchSignals {
    full: Signal,
    dispatch: Signal,
}

impl BatchSignals {
    pub(crate) fn new() -> Self {
        Self {
            full: Signal::new(),
            dispatch: Signal::new(),
        }
    }

    /// Resolves once the batch has reached capacity.
    pub fn full(&self) -> Fired {
        self.full.fired()
    }

    /// Resolves once a manual dispatch has been requested.
    pub fn dispatched(&self) -> Fired {
        self.dispatch.fired()
    }

    pub(crate) fn fire_full(&self) {
        self.full.fire();
    }

    pub(crate) fn fire_dispatch(&self) {
        self.dispatch.fire();
    }

    pub(crate) fn full_fired(&self) -> bool {
        self.full.is_fired()
    }

    pub(crate) fn dispatch_fired(&self) -> bool {
        self.dispatch.is_fired()
    }
}

/// Decides when each batch flushes.
///
/// `begin` is called exactly once per opened batch. The returned future must
/// resolve at the earliest of the batch filling, a manual dispatch, or any
/// trigger of its own, such as a timer. Cancellation of the loader's token
/// is handled outside the schedule: a cancelled loader never flushes,
/// whatever the schedule says.
///
/// Plain functions and closures `Fn(BatchSignals) -> impl Future<Output =
/// ()>` can be used directly as schedules.
pub trait DispatchSchedule {
    type Wait: Future<Output = ()>;

    fn begin(&self, signals: BatchSignals) -> Self::Wait;
}

impl<F, W> DispatchSchedule for F
where
    F: Fn(BatchSignals) -> W,
    W: Future<Output = ()>,
{
    type Wait = W;

    fn begin(&self, signals: BatchSignals) -> W {
        self(signals)
    }
}

/// The stock schedule: flush after a fixed quiescence window, or sooner when
/// the batch fills or a manual dispatch arrives.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    window: Duration,
}

impl TimeWindow {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl DispatchSchedule for TimeWindow {
    type Wait = WindowWait;

    fn begin(&self, signals: BatchSignals) -> WindowWait {
        WindowWait {
            delay: Delay::new(self.window),
            full: signals.full(),
            dispatched: signals.dispatched(),
        }
    }
}

/// Wait future of [`TimeWindow`]. Dropping it cancels the timer, so an
/// early flush does not leak a pending delay.
#[derive(Debug)]
pub struct WindowWait {
    delay: Delay,
    full: Fired,
    dispatched: Fired,
}

impl Future for WindowWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);
        if Pin::new(&mut this.full).poll(cx).is_ready()
            || Pin::new(&mut this.dispatched).poll(cx).is_ready()
            || Pin::new(&mut this.delay).poll(cx).is_ready()
        {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
