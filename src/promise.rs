use crate::{
    cell::{Outcome, ResolutionCell},
    chain::{guarded, walk, ChainLink, Continue, OnFailure, OnSuccess, Reaction},
    dispatch::{self, Executor, SerialQueue},
    Error, Failure, State, Value,
};
use std::{any::Any, cell::RefCell, fmt, sync::Arc, task::Waker};
use tracing::{debug, trace, warn};

/// A single-assignment handle to a value or failure that may not exist yet.
///
/// Clones share the same underlying promise. Everything derived from a
/// promise runs on the executor the promise was created with.
///
/// # Examples
///
/// ```
/// use promise_chain::{Error, Promise};
///
/// let promise: Promise<i32> = Promise::new();
/// let big = promise.filter(|v| *v > 5).map(|v| v.to_string());
///
/// promise.resolve(6).unwrap();
/// assert_eq!(big.get_value(), Ok("6".to_string()));
/// assert_eq!(promise.resolve(7), Err(Error::AlreadyResolved));
/// ```
pub struct Promise<T, E = Error>
where
    T: Value,
    E: Failure,
{
    inner: Arc<Inner<T, E>>,
}

struct Inner<T, E>
where
    T: Value,
    E: Failure,
{
    cell: ResolutionCell<T, E, Reaction<T, E>>,
    queue: SerialQueue,
}

impl<T, E> Inner<T, E>
where
    T: Value,
    E: Failure,
{
    fn flush(&self, reactions: Vec<Reaction<T, E>>, outcome: &Outcome<T, E>) {
        if !reactions.is_empty() {
            self.queue.submit(walk(reactions, outcome.clone()));
        }
    }

    fn subscribe(&self, reaction: Reaction<T, E>) {
        self.cell.listen(reaction, |reaction, outcome| {
            self.queue.submit(walk(vec![reaction], outcome.clone()))
        });
    }
}

impl<T, E> Drop for Inner<T, E>
where
    T: Value,
    E: Failure,
{
    fn drop(&mut self) {
        let listeners = self.cell.take_listeners();
        if !listeners.is_empty() {
            retire(Box::new(listeners));
        }
    }
}

thread_local! {
    static RETIRED: RefCell<Option<Vec<Box<dyn Any>>>> = const { RefCell::new(None) };
}

/// Frees unfired listeners one at a time.
///
/// A pending listener owns its downstream promise, which owns its own
/// listeners, so dropping the head of a chain in place takes one stack frame
/// per link. Drops that happen while a retirement is running on this thread
/// are parked on a work list and freed by the outermost call instead.
fn retire(garbage: Box<dyn Any>) {
    let parked = RETIRED.try_with(|retired| match *retired.borrow_mut() {
        Some(ref mut pending) => {
            pending.push(garbage);
            None
        }
        ref mut idle @ None => {
            *idle = Some(Vec::new());
            Some(garbage)
        }
    });
    // Err: thread-local storage is already torn down and the garbage was
    // dropped in place along with the closure.
    let Ok(Some(first)) = parked else {
        return;
    };
    drop(first);
    while let Some(next) =
        RETIRED.with(|retired| retired.borrow_mut().as_mut().and_then(Vec::pop))
    {
        drop(next);
    }
    RETIRED.with(|retired| *retired.borrow_mut() = None);
}

impl<T: Value, E: Failure> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Value, E: Failure> Default for Promise<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Promise<T, E>
where
    T: Value,
    E: Failure,
{
    /// An unresolved promise dispatching on the global pool.
    pub fn new() -> Self {
        Self::with_executor(dispatch::global())
    }

    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cell: ResolutionCell::new(),
                queue: SerialQueue::new(executor),
            }),
        }
    }

    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.complete(Ok(value));
        promise
    }

    pub fn failed(error: E) -> Self {
        let promise = Self::new();
        promise.complete(Err(error));
        promise
    }

    fn derive<R: Value>(&self) -> Promise<R, E> {
        Promise::with_executor(self.inner.queue.executor())
    }

    /// Resolves the promise with `value`.
    ///
    /// Fails with [`Error::AlreadyResolved`] if the promise was resolved or
    /// failed before; the stored outcome is left untouched.
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        let inner = &*self.inner;
        inner
            .cell
            .try_succeed(value, |reactions, outcome| inner.flush(reactions, outcome))
            .map_err(|err| {
                debug!("rejected resolution of a settled promise");
                err
            })?;
        trace!("promise resolved");
        Ok(())
    }

    /// Fails the promise with `error`. Same rules as [`Promise::resolve`].
    pub fn fail(&self, error: E) -> Result<(), Error> {
        let inner = &*self.inner;
        inner
            .cell
            .try_fail(error, |reactions, outcome| inner.flush(reactions, outcome))
            .map_err(|err| {
                debug!("rejected failure of a settled promise");
                err
            })?;
        trace!("promise failed");
        Ok(())
    }

    /// Settles a promise owned by the library, such as the downstream end of
    /// a chain link.
    pub(crate) fn complete(&self, result: Result<T, E>) {
        let settled = match result {
            Ok(value) => self.resolve(value),
            Err(error) => self.fail(error),
        };
        if settled.is_err() {
            warn!("derived promise was already settled by hand; dropping outcome");
        }
    }

    /// Binds a promise owned by the library to `source`. A failed binding is
    /// reported the same way as in [`Promise::complete`].
    pub(crate) fn bind(&self, source: &Promise<T, E>) {
        self.resolve_with(source)
            .inner
            .subscribe(Box::new(|bound: &Result<(), E>| {
                if bound.is_err() {
                    warn!("derived promise was already settled by hand; dropping outcome");
                }
            }));
    }

    /// Binds this promise to the eventual outcome of `other`.
    ///
    /// The returned promise resolves once the binding has been attempted. If
    /// this promise was already settled by then, it fails with
    /// [`Error::AlreadyResolved`] instead.
    pub fn resolve_with(&self, other: &Promise<T, E>) -> Promise<(), E> {
        let companion = self.derive::<()>();
        let target = self.clone();
        let report = companion.clone();
        other
            .inner
            .subscribe(Box::new(move |outcome: &Result<T, E>| {
                let bound = match outcome {
                    Ok(value) => target.resolve(value.clone()),
                    Err(error) => target.fail(error.clone()),
                };
                report.complete(bound.map_err(E::from));
            }));
        companion
    }

    pub fn is_done(&self) -> bool {
        self.inner.cell.is_done()
    }

    /// Blocks the calling thread until the promise is settled.
    pub fn get_value(&self) -> Result<T, E> {
        (*self.inner.cell.await_value()).clone()
    }

    /// Blocks until settled; `None` means the promise succeeded.
    pub fn get_failure(&self) -> Option<E> {
        match *self.inner.cell.await_value() {
            Ok(_) => None,
            Err(ref error) => Some(error.clone()),
        }
    }

    pub fn try_get(&self) -> Option<Result<T, E>> {
        self.inner.cell.peek().map(|outcome| (*outcome).clone())
    }

    pub fn state(&self) -> State<T, E> {
        match self.try_get() {
            None => State::Pending,
            Some(Ok(value)) => State::Succeeded(value),
            Some(Err(error)) => State::Failed(error),
        }
    }

    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Result<T, E>> {
        self.inner
            .cell
            .poll_value(waker)
            .map(|outcome| (*outcome).clone())
    }

    /// Runs `callback` on the dispatcher once the promise is settled, right
    /// away if it already is.
    ///
    /// The callback never runs inside the `resolve` or `fail` call that
    /// settles the promise. When that call is made from a dispatcher worker
    /// (from inside another callback or continuation), the callback may later
    /// run on that same worker once the current task has returned.
    pub fn on_resolve<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .subscribe(Box::new(move |_: &Result<T, E>| callback()));
        self
    }

    fn chain<R: Value>(
        &self,
        on_success: OnSuccess<T, R, E>,
        on_failure: Option<OnFailure<R, E>>,
    ) -> Promise<R, E> {
        let downstream = self.derive::<R>();
        let link = ChainLink::new(on_success, on_failure, downstream.clone());
        self.inner.subscribe(link.into_reaction());
        downstream
    }

    fn passthrough() -> OnSuccess<T, T, E> {
        Box::new(|value| Ok(Continue::Value(value)))
    }

    /// Chains a success continuation.
    ///
    /// Returning `Ok(Some(p))` binds the downstream promise to `p`,
    /// `Ok(None)` resolves it with `R::default()` and `Err(e)` fails it. A
    /// failure of this promise is passed down unchanged.
    pub fn then<R, S>(&self, on_success: S) -> Promise<R, E>
    where
        R: Value + Default,
        S: FnOnce(T) -> Result<Option<Promise<R, E>>, E> + Send + 'static,
    {
        self.chain(
            Box::new(move |value| on_success(value).map(bind_or_default)),
            None,
        )
    }

    /// Like [`Promise::then`], with a failure continuation as well.
    ///
    /// `on_failure` runs for its side effects. When it returns `Ok(())` the
    /// downstream promise fails with the original error, when it returns
    /// `Err(e)` the downstream fails with `e`.
    pub fn then_with<R, S, F>(&self, on_success: S, on_failure: F) -> Promise<R, E>
    where
        R: Value + Default,
        S: FnOnce(T) -> Result<Option<Promise<R, E>>, E> + Send + 'static,
        F: FnOnce(&E) -> Result<(), E> + Send + 'static,
    {
        self.chain(
            Box::new(move |value| on_success(value).map(bind_or_default)),
            Some(Box::new(move |error: &E| on_failure(error).map(|()| None))),
        )
    }

    /// Runs `callback` whatever the outcome, then passes the outcome on.
    pub fn then_callback<F>(&self, callback: F) -> Promise<T, E>
    where
        F: FnOnce() + Send + 'static,
    {
        let downstream = self.derive::<T>();
        let target = downstream.clone();
        self.inner
            .subscribe(Box::new(move |outcome: &Result<T, E>| {
                let result = guarded::<(), E, _>(|| {
                    callback();
                    Ok(())
                })
                .and_then(|()| outcome.clone());
                target.complete(result);
            }));
        downstream
    }

    pub fn map<R, F>(&self, mapper: F) -> Promise<R, E>
    where
        R: Value,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.chain(
            Box::new(move |value| Ok(Continue::Value(mapper(value)))),
            None,
        )
    }

    /// [`Promise::map`] with a mapper that may fail.
    pub fn try_map<R, F>(&self, mapper: F) -> Promise<R, E>
    where
        R: Value,
        F: FnOnce(T) -> Result<R, E> + Send + 'static,
    {
        self.chain(
            Box::new(move |value| mapper(value).map(Continue::Value)),
            None,
        )
    }

    pub fn flat_map<R, F>(&self, mapper: F) -> Promise<R, E>
    where
        R: Value,
        F: FnOnce(T) -> Promise<R, E> + Send + 'static,
    {
        self.chain(
            Box::new(move |value| Ok(Continue::Bind(mapper(value)))),
            None,
        )
    }

    /// Keeps the value only if `predicate` accepts it; otherwise the result
    /// fails with [`Error::PredicateRejected`].
    pub fn filter<P>(&self, predicate: P) -> Promise<T, E>
    where
        P: FnOnce(&T) -> bool + Send + 'static,
    {
        self.chain(
            Box::new(move |value| {
                if predicate(&value) {
                    Ok(Continue::Value(value))
                } else {
                    Err(E::from(Error::PredicateRejected))
                }
            }),
            None,
        )
    }

    /// Turns a failure into a value. `None` from `recovery` keeps the
    /// original failure.
    pub fn recover<F>(&self, recovery: F) -> Promise<T, E>
    where
        F: FnOnce(&E) -> Option<T> + Send + 'static,
    {
        self.chain(
            Self::passthrough(),
            Some(Box::new(move |error: &E| {
                Ok(recovery(error).map(Continue::Value))
            })),
        )
    }

    /// Like [`Promise::recover`], binding to a replacement promise.
    pub fn recover_with<F>(&self, recovery: F) -> Promise<T, E>
    where
        F: FnOnce(&E) -> Option<Promise<T, E>> + Send + 'static,
    {
        self.chain(
            Self::passthrough(),
            Some(Box::new(move |error: &E| {
                Ok(recovery(error).map(Continue::Bind))
            })),
        )
    }

    /// On failure, takes the value of `fallback` instead. If `fallback` fails
    /// too, the result carries this promise's failure, not the fallback's.
    ///
    /// Nothing blocks while waiting for `fallback`: the failure continuation
    /// binds to a promise derived from it.
    pub fn fallback_to(&self, fallback: &Promise<T, E>) -> Promise<T, E> {
        let fallback = fallback.clone();
        self.chain(
            Self::passthrough(),
            Some(Box::new(move |error: &E| {
                let original = error.clone();
                let rescue = fallback.chain(
                    Self::passthrough(),
                    Some(Box::new(move |_: &E| Err(original))),
                );
                Ok(Some(Continue::Bind(rescue)))
            })),
        )
    }
}

fn bind_or_default<R, E>(next: Option<Promise<R, E>>) -> Continue<R, E>
where
    R: Value + Default,
    E: Failure,
{
    match next {
        Some(promise) => Continue::Bind(promise),
        None => Continue::Value(R::default()),
    }
}

impl<T, E> fmt::Debug for Promise<T, E>
where
    T: Value + fmt::Debug,
    E: Failure + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Promise");
        match self.inner.cell.peek() {
            None => out.field("state", &"Pending"),
            Some(outcome) => match *outcome {
                Ok(ref value) => out.field("value", value),
                Err(ref error) => out.field("failure", error),
            },
        };
        out.finish()
    }
}
