use std::task::Waker;

/// Identifies one registered waker within a [`WakerSet`]. Tokens are only
/// meaningful for the set that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WakerToken(usize);

/// The wakers of every reader parked on a single shared computation.
///
/// Only one task needs to actually drive a shared computation forward, but
/// any of the interested tasks must be able to take its place if it goes
/// away. The set therefore tracks a "driving" waker: always the waker that
/// most recently polled the shared work. When the driver's registration is
/// discarded (its future was dropped or resolved on its own), another
/// registered waker is promoted and woken so the chain of responsibility is
/// never broken.
///
/// Storage is a slot vector with a free list, so tokens stay stable while
/// readers come and go.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    slots: Vec<Option<Waker>>,
    free: Vec<usize>,
    driver: Option<usize>,
}

impl WakerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, waker: Waker) -> WakerToken {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(waker);
                slot
            }
            None => {
                self.slots.push(Some(waker));
                self.slots.len() - 1
            }
        };
        self.driver = Some(slot);
        WakerToken(slot)
    }

    fn replace(&mut self, token: WakerToken, waker: &Waker) {
        let current = self.slots[token.0]
            .as_mut()
            .expect("no waker registered under this token");
        if !current.will_wake(waker) {
            current.clone_from(waker);
        }
        self.driver = Some(token.0);
    }

    /// Add a new waker (when `token` is `None`) or refresh an existing
    /// registration, writing the token back in place. Either way the caller
    /// becomes the driving waker, on the assumption that it has just polled
    /// the shared work.
    pub fn register(&mut self, waker: &Waker, token: &mut Option<WakerToken>) {
        match *token {
            Some(token) => self.replace(token, waker),
            None => *token = Some(self.add(waker.clone())),
        }
    }

    /// Remove a registration without waking anyone. Used by readers that
    /// already have their result in hand.
    pub fn discard(&mut self, token: WakerToken) {
        self.slots[token.0] = None;
        self.free.push(token.0);
        if self.driver == Some(token.0) {
            self.driver = None;
        }
    }

    /// Remove a registration and, if it was the driving waker (or no driver
    /// is known), promote an arbitrary remaining waker and wake it so the
    /// shared computation keeps moving.
    ///
    /// The promotion happens eagerly: a run of drops without an intervening
    /// poll must still leave one live task woken at the end.
    pub fn discard_and_promote(&mut self, token: WakerToken) {
        let was_driver = self.driver == Some(token.0) || self.driver.is_none();
        self.discard(token);
        if was_driver {
            if let Some(slot) = self.slots.iter().position(Option::is_some) {
                self.driver = Some(slot);
                self.slots[slot]
                    .as_ref()
                    .expect("promoted an empty waker slot")
                    .wake_by_ref();
            }
        }
    }

    /// Wake every registered waker.
    pub fn wake_all(&self) {
        for waker in self.slots.iter().flatten() {
            waker.wake_by_ref();
        }
    }
}
