use crate::{Failure, Promise, Value};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Awaiting a promise yields a clone of its outcome, so any number of
/// clones may be awaited from different tasks.
///
/// # Examples
///
/// ```
/// use promise_chain::Promise;
/// use futures::executor::block_on;
/// use std::thread;
/// let promise: Promise<String> = Promise::new();
/// let consumer = promise.clone();
/// let consumer2 = promise.clone();
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received on task 1 {:?}", consumer.await);
/// }));
/// let task2 = thread::spawn(move || block_on(async {
///     println!("Received on task 2 {:?}", consumer2.await);
/// }));
/// promise.resolve("Hi".into()).unwrap();
/// task1.join().expect("The task1 thread has panicked.");
/// task2.join().expect("The task2 thread has panicked.");
/// ```
impl<T, E> Future for Promise<T, E>
where
    T: Value,
    E: Failure,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, Promise};
    use futures::{executor::block_on, future::join};
    use std::thread;

    #[test]
    fn test_await_resolved_promise() {
        let promise = Promise::<u32>::resolved(5);
        assert_eq!(block_on(promise.clone()), Ok(5));
        // awaiting does not consume the outcome
        assert_eq!(block_on(promise), Ok(5));
    }

    #[test]
    fn test_two_consumers_wake() {
        let promise: Promise<String> = Promise::new();
        let op_a = promise.clone();
        let op_b = promise.clone();
        let task1 = thread::spawn(move || block_on(op_a));
        let task2 = thread::spawn(move || block_on(op_b));
        promise.resolve(String::from("🍓")).unwrap();
        assert_eq!(task1.join().unwrap(), Ok(String::from("🍓")));
        assert_eq!(task2.join().unwrap(), Ok(String::from("🍓")));
    }

    #[test]
    fn test_join_derived_promises() {
        let promise: Promise<i32> = Promise::new();
        let doubled = promise.map(|v| v * 2);
        let rejected = promise.filter(|v| *v > 100);
        promise.resolve(21).unwrap();
        let (a, b) = block_on(join(doubled, rejected));
        assert_eq!(a, Ok(42));
        assert_eq!(b, Err(Error::PredicateRejected));
    }
}
