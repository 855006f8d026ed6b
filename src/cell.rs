//! Single-assignment storage behind every promise.
//!
//! The cell owns the outcome together with whatever is waiting for it, all
//! under one lock, so "register a listener" and "resolve" can never interleave
//! halfway.
use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::{mem, sync::Arc, task::Waker};

/// A resolved outcome, shared by every reader.
pub(crate) type Outcome<T, E> = Arc<Result<T, E>>;

pub(crate) struct ResolutionCell<T, E, L> {
    slot: Mutex<Slot<T, E, L>>,
    resolved: Condvar,
}

struct Slot<T, E, L> {
    outcome: Option<Outcome<T, E>>,
    listeners: Vec<L>,
    wakers: Vec<Waker>,
}

impl<T, E, L> ResolutionCell<T, E, L> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                outcome: None,
                listeners: Vec::new(),
                wakers: Vec::new(),
            }),
            resolved: Condvar::new(),
        }
    }

    pub(crate) fn try_succeed<F>(&self, value: T, flush: F) -> Result<(), Error>
    where
        F: FnOnce(Vec<L>, &Outcome<T, E>),
    {
        self.try_complete(Ok(value), flush)
    }

    pub(crate) fn try_fail<F>(&self, error: E, flush: F) -> Result<(), Error>
    where
        F: FnOnce(Vec<L>, &Outcome<T, E>),
    {
        self.try_complete(Err(error), flush)
    }

    /// Moves the cell to its terminal state. `flush` receives the listeners
    /// registered so far and runs before the lock is released.
    pub(crate) fn try_complete<F>(&self, result: Result<T, E>, flush: F) -> Result<(), Error>
    where
        F: FnOnce(Vec<L>, &Outcome<T, E>),
    {
        let wakers = {
            let mut slot = self.slot.lock();
            if slot.outcome.is_some() {
                return Err(Error::AlreadyResolved);
            }
            let outcome = Arc::new(result);
            slot.outcome = Some(outcome.clone());
            flush(mem::take(&mut slot.listeners), &outcome);
            mem::take(&mut slot.wakers)
        };
        self.resolved.notify_all();
        for waker in wakers {
            waker.wake()
        }
        Ok(())
    }

    /// Queues `listener` while pending. Once resolved, hands it straight to
    /// `late` instead, still under the lock.
    pub(crate) fn listen<F>(&self, listener: L, late: F)
    where
        F: FnOnce(L, &Outcome<T, E>),
    {
        let mut slot = self.slot.lock();
        match slot.outcome {
            Some(ref outcome) => late(listener, outcome),
            None => slot.listeners.push(listener),
        }
    }

    /// Listeners that never fired. Only reachable once the cell is owned
    /// exclusively, so no lock is taken.
    pub(crate) fn take_listeners(&mut self) -> Vec<L> {
        mem::take(&mut self.slot.get_mut().listeners)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.slot.lock().outcome.is_some()
    }

    pub(crate) fn peek(&self) -> Option<Outcome<T, E>> {
        self.slot.lock().outcome.clone()
    }

    /// Blocks the calling thread until the cell is resolved.
    pub(crate) fn await_value(&self) -> Outcome<T, E> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(ref outcome) = slot.outcome {
                return outcome.clone();
            }
            self.resolved.wait(&mut slot);
        }
    }

    /// Non-blocking read that remembers `waker` if nothing is there yet.
    pub(crate) fn poll_value(&self, waker: &Waker) -> Option<Outcome<T, E>> {
        let mut slot = self.slot.lock();
        match slot.outcome {
            Some(ref outcome) => Some(outcome.clone()),
            None => {
                if !slot.wakers.iter().any(|w| w.will_wake(waker)) {
                    slot.wakers.push(waker.clone());
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResolutionCell;
    use crate::Error;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    type Cell = ResolutionCell<u32, String, u32>;

    #[test]
    fn test_second_resolution_is_rejected() {
        let cell = Cell::new();
        assert!(!cell.is_done());
        assert_eq!(cell.try_succeed(1, |_, _| {}), Ok(()));
        assert_eq!(cell.try_succeed(2, |_, _| {}), Err(Error::AlreadyResolved));
        assert_eq!(
            cell.try_fail("late".into(), |_, _| {}),
            Err(Error::AlreadyResolved)
        );
        assert!(cell.is_done());
        assert_eq!(*cell.await_value(), Ok(1));
    }

    #[test]
    fn test_flush_receives_listeners_in_order() {
        let cell = Cell::new();
        for id in 1..=3 {
            cell.listen(id, |_, _| panic!("cell is still pending"));
        }
        let mut flushed = Vec::new();
        cell.try_fail("boom".into(), |listeners, outcome| {
            assert_eq!(**outcome, Err("boom".to_string()));
            flushed = listeners;
        })
        .unwrap();
        assert_eq!(flushed, vec![1, 2, 3]);
    }

    #[test]
    fn test_late_listener_is_handed_back() {
        let cell = Cell::new();
        cell.try_succeed(7, |listeners, _| assert!(listeners.is_empty()))
            .unwrap();
        let mut late = None;
        cell.listen(9, |id, outcome| late = Some((id, (**outcome).clone())));
        assert_eq!(late, Some((9, Ok(7))));
    }

    #[test]
    fn test_take_listeners_empties_pending_cell() {
        let mut cell = Cell::new();
        cell.listen(1, |_, _| panic!("cell is still pending"));
        cell.listen(2, |_, _| panic!("cell is still pending"));
        assert_eq!(cell.take_listeners(), vec![1, 2]);
        assert!(cell.take_listeners().is_empty());
        assert!(!cell.is_done());
    }

    #[test]
    fn test_await_value_is_repeatable_across_threads() {
        let cell = Arc::new(Cell::new());
        let barrier = Arc::new(Barrier::new(5));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (*cell.await_value()).clone()
                })
            })
            .collect();
        barrier.wait();
        cell.try_succeed(42, |_, _| {}).unwrap();
        for reader in readers {
            assert_eq!(reader.join().expect("reader panicked"), Ok(42));
        }
        assert_eq!(cell.peek().map(|o| (*o).clone()), Some(Ok(42)));
    }
}
