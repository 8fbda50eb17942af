//! A request-coalescing batch loader.
//!
//! Sits between application code and a slow, batch-capable backend and
//! guarantees that identical concurrent loads share one in-flight result,
//! and that distinct loads arriving within a short window are folded into a
//! single backend batch call. This is the usual building block behind
//! per-request object resolution layers that would otherwise issue N+1
//! queries.
//!
//! The crate is executor-agnostic: batches are driven by the readers
//! awaiting them, so it works under any async runtime (or none, via manual
//! polling). Cancellation uses [`CancellationToken`]; the loader's
//! construction token stops future flushes, while each reader's token
//! cancels only that reader's wait.

mod batch;
mod cache;
mod key;
mod loader;
mod schedule;
mod signal;
mod thunk;
mod wakerset;

#[cfg(test)]
mod test;

pub use batch::BatchFn;
pub use cache::{CacheMap, InMemoryCache, NoCache};
pub use key::{KeyFingerprint, MirrorKey};
pub use loader::{DefaultRules, Hook, Loader, LoaderRules, DEFAULT_MAX_BATCH_SIZE};
pub use schedule::{BatchSignals, DispatchSchedule, TimeWindow, WindowWait, DEFAULT_WINDOW};
pub use signal::Fired;
pub use thunk::{Get, LoadError, Thunk};

pub use tokio_util::sync::CancellationToken;
