//! Execution contexts for continuations.
//!
//! Promises do not own threads. Every promise owns a serial queue token
//! that funnels its work, one task at a time and in submission order, into a
//! shared [`Executor`]. The default executor is a lazily built [`ThreadPool`].
use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    io,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, available_parallelism},
};
use tracing::{debug, error, info, trace};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a task asynchronously.
///
/// `execute` must hand the task off and return without running it. It is
/// called with the submitting promise's lock held, and that lock is not
/// reentrant: a task run inline that reads, resolves or registers on the same
/// promise deadlocks the caller. Debug builds panic as soon as a queue drain
/// starts inside `execute`.
///
/// A task may run on whatever thread the executor picks, including the
/// thread that submitted it once that thread has returned to the executor.
/// Resolving a promise from inside a pool worker can therefore have its
/// callbacks run later on that same worker; never inside the resolving call.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

const DEFAULT_THREAD_NAME: &str = "promise-dispatch";

static GLOBAL: Lazy<Arc<ThreadPool>> = Lazy::new(|| {
    let threads = available_parallelism().map_or(2, |n| n.get().max(2));
    let pool = ThreadPool::builder()
        .num_threads(threads)
        .build()
        .expect("failed to spawn the global promise dispatcher");
    Arc::new(pool)
});

/// The shared pool used by [`crate::Promise::new`].
pub fn global() -> Arc<dyn Executor> {
    GLOBAL.clone()
}

/// Configures a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolBuilder {
    num_threads: Option<NonZeroUsize>,
    thread_name: String,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self {
            num_threads: None,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl ThreadPoolBuilder {
    /// Number of worker threads. Zero is bumped to one; unset means one per
    /// available core.
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.num_threads = NonZeroUsize::new(threads.max(1));
        self
    }

    /// Prefix for worker thread names; workers are suffixed with their index.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> io::Result<ThreadPool> {
        let size = match self.num_threads {
            Some(size) => size,
            None => available_parallelism().unwrap_or(NonZeroUsize::MIN),
        };
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(size.get());
        for id in 0..size.get() {
            workers.push(Worker::spawn(
                id,
                format!("{}-{id}", self.thread_name),
                receiver.clone(),
            )?);
        }
        debug!(threads = size.get(), name = %self.thread_name, "dispatcher pool started");
        Ok(ThreadPool {
            sender: Some(sender),
            workers,
        })
    }
}

/// A fixed set of workers pulling tasks from one shared queue.
pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    workers: Vec<Worker>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::default()
    }

    pub fn new(size: NonZeroUsize) -> io::Result<Self> {
        Self::builder().num_threads(size.get()).build()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) {
        let sent = match self.sender {
            Some(ref sender) => sender.send(task).is_ok(),
            None => false,
        };
        if !sent {
            error!("tried to dispatch a task while the pool is shut down");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        let current = thread::current().id();
        for worker in self.workers.iter_mut() {
            info!(worker = worker.id, "shutting down dispatcher worker");
            if let Some(handle) = worker.thread.take() {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    error!(worker = worker.id, "dispatcher worker panicked");
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, name: String, receiver: Receiver<Task>) -> io::Result<Self> {
        let thread = thread::Builder::new().name(name).spawn(move || {
            for task in receiver.iter() {
                trace!(worker = id, "worker got a task; executing");
                run_task(task);
            }
            debug!(worker = id, "worker disconnected; shutting down");
        })?;
        Ok(Worker {
            id,
            thread: Some(thread),
        })
    }
}

fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(panic = %panic_message(&*payload), "dispatched task panicked");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Per-promise serial execution token.
///
/// At most one drain of a queue is scheduled on the executor at any time, so
/// tasks run one after another in the order they were submitted.
pub(crate) struct SerialQueue {
    executor: Arc<dyn Executor>,
    state: Arc<Mutex<QueueState>>,
}

struct QueueState {
    tasks: VecDeque<Task>,
    scheduled: bool,
}

impl SerialQueue {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            state: Arc::new(Mutex::new(QueueState {
                tasks: VecDeque::new(),
                scheduled: false,
            })),
        }
    }

    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    pub(crate) fn submit(&self, task: Task) {
        let schedule = {
            let mut state = self.state.lock();
            state.tasks.push_back(task);
            let idle = !state.scheduled;
            state.scheduled = true;
            idle
        };
        if schedule {
            let state = self.state.clone();
            let _submitting = Submitting::enter();
            self.executor.execute(Box::new(move || drain(&state)));
        }
    }
}

thread_local! {
    static SUBMITTING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside `Executor::execute` for a queue drain.
struct Submitting;

impl Submitting {
    fn enter() -> Self {
        SUBMITTING.with(|flag| flag.set(true));
        Submitting
    }
}

impl Drop for Submitting {
    fn drop(&mut self) {
        SUBMITTING.with(|flag| flag.set(false));
    }
}

fn drain(state: &Mutex<QueueState>) {
    debug_assert!(
        !SUBMITTING.with(Cell::get),
        "Executor::execute ran a queue drain inline"
    );
    loop {
        let task = {
            let mut state = state.lock();
            match state.tasks.pop_front() {
                Some(task) => task,
                None => {
                    state.scheduled = false;
                    return;
                }
            }
        };
        run_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::{Executor, SerialQueue, Task, ThreadPool};
    use std::{
        sync::{mpsc, Arc},
        thread,
        time::Duration,
    };

    #[test]
    fn test_pool_runs_tasks_on_named_workers() {
        let pool = ThreadPool::builder()
            .num_threads(2)
            .thread_name("test-pool")
            .build()
            .unwrap();
        assert_eq!(pool.size(), 2);
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        }));
        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("test-pool-"), "{name}");
    }

    #[test]
    fn test_zero_threads_means_one() {
        let pool = ThreadPool::builder().num_threads(0).build().unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_serial_queue_keeps_submission_order() {
        let pool: Arc<dyn Executor> =
            Arc::new(ThreadPool::builder().num_threads(4).build().unwrap());
        let queue = SerialQueue::new(pool);
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            queue.submit(Box::new(move || {
                if i % 10 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                tx.send(i).unwrap();
            }));
        }
        let seen: Vec<i32> = rx.iter().take(100).collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_task_does_not_stall_queue() {
        let pool: Arc<dyn Executor> =
            Arc::new(ThreadPool::builder().num_threads(1).build().unwrap());
        let queue = SerialQueue::new(pool);
        let (tx, rx) = mpsc::channel();
        queue.submit(Box::new(|| panic!("boom")));
        queue.submit(Box::new(move || tx.send("after").unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("after"));
    }

    struct Inline;

    impl Executor for Inline {
        fn execute(&self, task: Task) {
            task()
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "ran a queue drain inline")]
    fn test_inline_executor_is_caught() {
        let queue = SerialQueue::new(Arc::new(Inline));
        queue.submit(Box::new(|| {}));
    }

    #[test]
    fn test_drop_joins_workers() {
        let pool = ThreadPool::builder().num_threads(3).build().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(Box::new(move || tx.send(i).unwrap()));
        }
        drop(pool);
        drop(tx);
        let mut seen: Vec<i32> = rx.iter().collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
