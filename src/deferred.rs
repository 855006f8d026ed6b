use crate::{dispatch::Executor, Error, Failure, Promise, Value};
use std::sync::Arc;
use tracing::debug;

/// The producing half of a promise. Resolving consumes it, so each
/// `Deferred` settles its promise at most once.
///
/// # Examples
///
/// ```
/// use promise_chain::Deferred;
/// use futures::executor::block_on;
/// use std::thread;
/// let (deferred, promise) = Deferred::<String>::new();
///
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received {:?}", promise.await);
/// }));
/// deferred.resolve("Hi".into()).unwrap();
/// task1.join().expect("The task1 thread has panicked.");
/// ```
pub struct Deferred<T, E = Error>
where
    T: Value,
    E: Failure,
{
    promise: Promise<T, E>,
    armed: bool,
}

impl<T, E> Deferred<T, E>
where
    T: Value,
    E: Failure,
{
    pub fn new() -> (Self, Promise<T, E>) {
        Self::from_promise(Promise::new())
    }

    pub fn with_executor(executor: Arc<dyn Executor>) -> (Self, Promise<T, E>) {
        Self::from_promise(Promise::with_executor(executor))
    }

    fn from_promise(promise: Promise<T, E>) -> (Self, Promise<T, E>) {
        let consumer = promise.clone();
        (
            Self {
                promise,
                armed: true,
            },
            consumer,
        )
    }

    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    pub fn resolve(mut self, value: T) -> Result<(), Error> {
        self.armed = false;
        self.promise.resolve(value)
    }

    pub fn fail(mut self, error: E) -> Result<(), Error> {
        self.armed = false;
        self.promise.fail(error)
    }

    /// Hands resolution over to `other`; see [`Promise::resolve_with`].
    pub fn resolve_with(mut self, other: &Promise<T, E>) -> Promise<(), E> {
        self.armed = false;
        self.promise.resolve_with(other)
    }
}

impl<T, E> Drop for Deferred<T, E>
where
    T: Value,
    E: Failure,
{
    /// If this is an unresolved producer, fail the promise.
    fn drop(&mut self) {
        if self.armed && self.promise.fail(E::from(Error::ProducerDropped)).is_ok() {
            debug!("deferred dropped before resolving; promise failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Deferred;
    use crate::{Error, ThreadPool};
    use futures::executor::block_on;
    use std::{sync::Arc, thread};

    #[test]
    fn test_deferred_resolve() {
        let (op, op_a) = Deferred::<String>::new();
        let task1 = thread::spawn(move || block_on(async { op_a.await }));
        let task2 = thread::spawn(move || op.resolve(String::from("🍓")));
        assert_eq!(task2.join().expect("The task2 thread has panicked"), Ok(()));
        assert_eq!(
            task1.join().expect("The task1 thread has panicked"),
            Ok(String::from("🍓"))
        );
    }

    #[test]
    fn test_deferred_unresolved() {
        let (op, op_a) = Deferred::<String>::new();
        let task = thread::spawn(move || {
            // move the producer into this thread but never resolve it
            std::mem::drop(op);
        });
        task.join().expect("The task thread has panicked");
        assert_eq!(op_a.get_failure(), Some(Error::ProducerDropped));
    }

    #[test]
    fn test_deferred_reject() {
        let (a, b) = Deferred::<String>::new();
        a.fail(Error::message("reject!!")).unwrap();
        assert_eq!(b.get_value(), Err(Error::message("reject!!")));
    }

    #[test]
    fn test_resolve_with_disarms_drop() {
        let pool = Arc::new(ThreadPool::builder().num_threads(2).build().unwrap());
        let (deferred, promise) = Deferred::<u32>::with_executor(pool.clone());
        let (source, source_promise) = Deferred::<u32>::with_executor(pool);
        let bound = deferred.resolve_with(&source_promise);
        assert!(!promise.is_done());
        source.resolve(9).unwrap();
        assert_eq!(bound.get_value(), Ok(()));
        assert_eq!(promise.get_value(), Ok(9));
    }

    #[test]
    fn test_promise_accessor_shares_state() {
        let (deferred, promise) = Deferred::<u32>::new();
        assert!(!deferred.promise().is_done());
        deferred.resolve(1).unwrap();
        assert_eq!(promise.get_value(), Ok(1));
    }
}
