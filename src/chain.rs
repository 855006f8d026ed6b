//! Chain links: the continuations registered by `then` and friends, and the
//! walker that fires them once the upstream promise resolves.
use crate::{
    cell::Outcome,
    dispatch::{panic_message, Task},
    Error, Failure, Promise, Value,
};
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, trace};

/// Anything waiting on an outcome. Chain links and `on_resolve` callbacks
/// share one queue so they fire in registration order.
pub(crate) type Reaction<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send + 'static>;

/// What a continuation wants the downstream promise to become.
pub(crate) enum Continue<R: Value, E: Failure> {
    Value(R),
    Bind(Promise<R, E>),
}

pub(crate) type OnSuccess<T, R, E> = Box<dyn FnOnce(T) -> Result<Continue<R, E>, E> + Send>;

/// `Ok(None)` keeps the upstream failure, `Ok(Some(_))` recovers from it and
/// `Err(_)` replaces it.
pub(crate) type OnFailure<R, E> = Box<dyn FnOnce(&E) -> Result<Option<Continue<R, E>>, E> + Send>;

pub(crate) struct ChainLink<T, R, E>
where
    R: Value,
    E: Failure,
{
    on_success: OnSuccess<T, R, E>,
    on_failure: Option<OnFailure<R, E>>,
    downstream: Promise<R, E>,
}

impl<T, R, E> ChainLink<T, R, E>
where
    T: Value,
    R: Value,
    E: Failure,
{
    pub(crate) fn new(
        on_success: OnSuccess<T, R, E>,
        on_failure: Option<OnFailure<R, E>>,
        downstream: Promise<R, E>,
    ) -> Self {
        Self {
            on_success,
            on_failure,
            downstream,
        }
    }

    pub(crate) fn into_reaction(self) -> Reaction<T, E> {
        Box::new(move |outcome: &Result<T, E>| self.fire(outcome))
    }

    fn fire(self, outcome: &Result<T, E>) {
        let ChainLink {
            on_success,
            on_failure,
            downstream,
        } = self;
        match outcome {
            Ok(value) => {
                let value = value.clone();
                match guarded(move || on_success(value)) {
                    Ok(next) => proceed(&downstream, next),
                    Err(error) => downstream.complete(Err(error)),
                }
            }
            Err(error) => {
                let handled = match on_failure {
                    Some(on_failure) => guarded(|| on_failure(error)),
                    None => Ok(None),
                };
                match handled {
                    Ok(Some(next)) => proceed(&downstream, next),
                    Ok(None) => downstream.complete(Err(error.clone())),
                    Err(replaced) => downstream.complete(Err(replaced)),
                }
            }
        }
    }
}

fn proceed<R: Value, E: Failure>(downstream: &Promise<R, E>, next: Continue<R, E>) {
    match next {
        Continue::Value(value) => downstream.complete(Ok(value)),
        Continue::Bind(source) => downstream.bind(&source),
    }
}

/// Runs a continuation, turning a panic into a failure of type `E`.
pub(crate) fn guarded<X, E, F>(f: F) -> Result<X, E>
where
    E: Failure,
    F: FnOnce() -> Result<X, E>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = panic_message(&*payload);
        trace!(panic = %msg, "continuation panicked");
        Err(E::from(Error::Panicked(msg)))
    })
}

/// Builds the task that fires `reactions` in order against `outcome`.
pub(crate) fn walk<T, E>(reactions: Vec<Reaction<T, E>>, outcome: Outcome<T, E>) -> Task
where
    T: Value,
    E: Failure,
{
    Box::new(move || {
        trace!(links = reactions.len(), "walking chain");
        for reaction in reactions {
            let fired = panic::catch_unwind(AssertUnwindSafe(|| reaction(outcome.as_ref())));
            if let Err(payload) = fired {
                error!(panic = %panic_message(&*payload), "promise callback panicked");
            }
        }
    })
}
