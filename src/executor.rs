//! Job pools with future-like submission handles.
//!
//! Two independent facades share one implementation: [`TaskExecutor`],
//! sized for I/O-bound concurrency, and [`CpuTaskExecutor`], bounded by
//! [`available_parallelism()`](crate::available_parallelism) for CPU-bound
//! parallelism. Both hand back a [`JobHandle`] per submission and keep no
//! other reference to the job.
//!
//! # Shutdown
//!
//! Shutdown is non-blocking and trades completeness for a fast exit:
//! intake stops, queued-but-not-started jobs are abandoned (their handles
//! resolve to [`JobError`](crate::JobError)`::Abandoned`), and
//! already-running jobs finish in the background on detached threads.
//! A submission attempted after shutdown is logged and returns `None`
//! rather than failing.

use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use trace_err::*;

use crate::job_handle::{JobError, JobHandle, job_handle_pair, panic_message};

type QueuedJob = Box<dyn FnOnce() + Send>;

struct Inner {
    queue: Mutex<Option<crossbeam_channel::Sender<QueuedJob>>>,
    shutdown: AtomicBool,
}

/// A process-wide pool of worker threads for I/O-bound background jobs.
///
/// Cheap to clone; clones share the pool. Construct one per application
/// lifetime and pass it down as a dependency rather than holding a global.
///
/// # Example
///
/// ```
/// use offload::TaskExecutor;
///
/// let pool = TaskExecutor::default();
/// let handle = pool.submit(|| 21 * 2).unwrap();
/// assert_eq!(handle.result().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

impl TaskExecutor {
    /// Creates a pool of `threads` named worker threads.
    pub fn new(threads: NonZeroUsize, name_prefix: &str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<QueuedJob>();
        let inner = Arc::new(Inner {
            queue: Mutex::new(Some(tx)),
            shutdown: AtomicBool::new(false),
        });

        for i in 0..threads.get() {
            let rx = rx.clone();
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("{name_prefix}-{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        if inner.shutdown.load(Ordering::Acquire) {
                            // Queued but never started; abandon it.
                            drop(job);
                            continue;
                        }
                        job();
                    }
                })
                .trace_expect("Failed to spawn pool worker thread");
        }

        Self { inner }
    }

    /// Submits a job for execution, returning a handle to its result.
    ///
    /// Returns `None` without failing if shutdown has begun; the refusal
    /// is logged at debug level. A panic inside the job is caught on the
    /// worker thread and re-raised from [`JobHandle::result`].
    pub fn submit<T, F>(&self, job: F) -> Option<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            tracing::debug!("job submission refused; the executor is shutting down");
            return None;
        }

        let (completion, handle) = job_handle_pair();
        let task: QueuedJob = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(job)) {
                Ok(value) => completion.fulfill(Ok(value)),
                Err(payload) => {
                    completion.fulfill(Err(JobError::Panicked(panic_message(payload.as_ref()))))
                }
            }
        });

        let queue = self.inner.queue.lock().trace_expect("Failed to lock mutex");
        let Some(tx) = queue.as_ref() else {
            tracing::debug!("job submission refused; the executor is shutting down");
            return None;
        };
        if tx.send(task).is_err() {
            tracing::debug!("job submission refused; the executor is shutting down");
            return None;
        }
        Some(handle)
    }

    /// Begins non-blocking shutdown.
    ///
    /// Stops intake, abandons queued-but-not-started jobs, and lets
    /// running jobs finish in the background. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!("cancelling queued background jobs");
        }
        // Disconnects the queue so idle workers exit.
        *self.inner.queue.lock().trace_expect("Failed to lock mutex") = None;
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Default for TaskExecutor {
    /// Sizes the pool for I/O-bound work: `min(32, available_parallelism + 4)`.
    fn default() -> Self {
        let threads = (usize::from(crate::available_parallelism()) + 4).min(32);
        Self::new(
            NonZeroUsize::new(threads).trace_expect("thread count is non-zero"),
            "offload-worker",
        )
    }
}

/// A pool bounded by the CPU count, for CPU-bound parallel jobs.
///
/// Same submission and shutdown semantics as [`TaskExecutor`].
#[derive(Clone)]
pub struct CpuTaskExecutor {
    inner: TaskExecutor,
}

impl CpuTaskExecutor {
    pub fn new() -> Self {
        Self {
            inner: TaskExecutor::new(crate::available_parallelism(), "offload-cpu"),
        }
    }

    /// See [`TaskExecutor::submit`].
    pub fn submit<T, F>(&self, job: F) -> Option<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.inner.submit(job)
    }

    /// See [`TaskExecutor::shutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }
}

impl Default for CpuTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps `func` so that calling the wrapper submits the call to `pool` and
/// returns a [`JobHandle`] instead of blocking.
///
/// Multi-argument functions take a tuple. If the pool has begun shutdown
/// the wrapper returns `None`, mirroring [`TaskExecutor::submit`].
///
/// # Example
///
/// ```
/// use offload::{TaskExecutor, call_threaded};
///
/// let pool = TaskExecutor::default();
/// let add = call_threaded(&pool, |(a, b): (i32, i32)| a + b);
///
/// let handle = add((2, 3)).unwrap();
/// assert_eq!(handle.result().unwrap(), 5);
/// ```
pub fn call_threaded<A, T, F>(pool: &TaskExecutor, func: F) -> impl Fn(A) -> Option<JobHandle<T>>
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> T + Send + Sync + Clone + 'static,
{
    let pool = pool.clone();
    move |args: A| {
        let func = func.clone();
        pool.submit(move || func(args))
    }
}
