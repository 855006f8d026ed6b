//! Single-assignment promises with chained continuations.
//!
//! A [`Promise`] is resolved exactly once, with a value or a failure. Consumers
//! block on it, await it, or derive new promises from it with [`Promise::map`],
//! [`Promise::flat_map`], [`Promise::filter`], [`Promise::recover`] and friends.
//! Continuations never run inside the call that resolved the promise; they
//! are handed to a per-promise serial queue backed by a shared thread pool.
//! A promise resolved from a pool worker may later see its callbacks run on
//! that same worker.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{Deferred, Promise};
//! use std::thread;
//!
//! let (deferred, promise) = Deferred::<u32>::new();
//! let doubled: Promise<u32> = promise.map(|v| v * 2);
//!
//! thread::spawn(move || deferred.resolve(21));
//! assert_eq!(doubled.get_value(), Ok(42));
//! ```
mod cell;
mod chain;
mod deferred;
pub mod dispatch;
mod future;
mod promise;

pub use deferred::Deferred;
pub use dispatch::{Executor, Task, ThreadPool, ThreadPoolBuilder};
pub use promise::Promise;

use thiserror::Error;

/// Errors produced by the promise machinery itself.
///
/// A caller-defined failure type only needs `From<Error>` to carry these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("promise is already resolved")]
    AlreadyResolved,
    #[error("predicate does not accept value")]
    PredicateRejected,
    #[error("continuation panicked: {0}")]
    Panicked(String),
    #[error("producer dropped without resolving the promise")]
    ProducerDropped,
    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn message(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }
}

/// Bound for success payloads. Values are cloned out to every reader.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// Bound for failure payloads.
pub trait Failure: From<Error> + Clone + Send + Sync + 'static {}

impl<E> Failure for E where E: From<Error> + Clone + Send + Sync + 'static {}

/// Snapshot of a promise, see [`Promise::state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E = Error> {
    Pending,
    Succeeded(T),
    Failed(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}
