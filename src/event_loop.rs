//! Background event loop for running futures from synchronous code.
//!
//! One cooperative scheduler (a current-thread tokio runtime) lives on a
//! single dedicated background thread for the life of the process.
//! [`run_coroutine`](EventLoopBridge::run_coroutine) may be called from any
//! thread and never blocks the caller; the result comes back through a
//! [`JobHandle`].
//!
//! # Example
//!
//! ```
//! use offload::EventLoopBridge;
//!
//! let bridge = EventLoopBridge::new();
//! bridge.start();
//!
//! let handle = bridge.run_coroutine(async { 40 + 2 }).unwrap();
//! assert_eq!(handle.result().unwrap(), 42);
//!
//! bridge.shutdown();
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use trace_err::*;

use crate::cancellation_token::CancellationToken;
use crate::job_handle::{JobError, JobHandle, job_handle_pair, panic_message};

struct Inner {
    handle: Mutex<Option<tokio::runtime::Handle>>,
    stop: CancellationToken,
}

/// A dedicated background event loop bridging sync call sites to futures.
///
/// Cheap to clone; clones share the one loop. The loop is single-use: once
/// [`shutdown()`](EventLoopBridge::shutdown) has been requested it cannot
/// be restarted.
#[derive(Clone)]
pub struct EventLoopBridge {
    inner: Arc<Inner>,
}

impl EventLoopBridge {
    /// Creates the bridge without starting the loop.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handle: Mutex::new(None),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Starts the background loop.
    ///
    /// Idempotent: a second call logs and no-ops, never creating a second
    /// loop.
    pub fn start(&self) {
        let mut slot = self.inner.handle.lock().trace_expect("Failed to lock mutex");
        if slot.is_some() {
            tracing::debug!("attempted to start the event loop while it is already running");
            return;
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .trace_expect("Failed to build the event loop runtime");
        *slot = Some(runtime.handle().clone());

        let stop = self.inner.stop.clone();
        std::thread::Builder::new()
            .name("offload-event-loop".to_string())
            .spawn(move || {
                tracing::debug!("starting background event loop");
                runtime.block_on(stop.cancelled());
                // Cooperative stop: release the runtime without blocking on
                // in-flight tasks.
                runtime.shutdown_background();
            })
            .trace_expect("Failed to spawn the event loop thread");
    }

    /// Returns `true` while the loop is accepting work.
    pub fn is_running(&self) -> bool {
        self.inner
            .handle
            .lock()
            .trace_expect("Failed to lock mutex")
            .is_some()
            && !self.inner.stop.is_requested()
    }

    /// Schedules `future` on the loop from any thread, without blocking.
    ///
    /// Returns `None`, with a debug log, if the loop is not running. A
    /// panicking future surfaces as a panic error from the handle; a future
    /// dropped by shutdown resolves the handle to abandoned rather than
    /// hanging the caller.
    pub fn run_coroutine<F>(&self, future: F) -> Option<JobHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = self.inner.handle.lock().trace_expect("Failed to lock mutex");
        let Some(handle) = slot.as_ref() else {
            tracing::debug!("coroutine refused; the event loop is not running");
            return None;
        };
        if self.inner.stop.is_requested() {
            tracing::debug!("coroutine refused; the event loop is shutting down");
            return None;
        }

        let (completion, job) = job_handle_pair();
        let task = handle.spawn(future);
        handle.spawn(async move {
            match task.await {
                Ok(value) => completion.fulfill(Ok(value)),
                Err(e) if e.is_panic() => {
                    let payload = e.into_panic();
                    completion.fulfill(Err(JobError::Panicked(panic_message(payload.as_ref()))));
                }
                Err(_) => completion.fulfill(Err(JobError::Abandoned)),
            }
        });
        Some(job)
    }

    /// Requests the loop to stop.
    ///
    /// Cooperative only: in-flight futures are not forcibly cancelled
    /// before the runtime is released. A no-op if the loop was never
    /// started.
    pub fn shutdown(&self) {
        if self
            .inner
            .handle
            .lock()
            .trace_expect("Failed to lock mutex")
            .is_none()
        {
            return;
        }
        tracing::debug!("stopping the background event loop");
        self.inner.stop.request();
    }
}

impl Default for EventLoopBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn run_coroutine_returns_the_coroutine_value() {
        let bridge = EventLoopBridge::new();
        bridge.start();
        let handle = bridge.run_coroutine(async { 6 * 7 }).unwrap();
        assert_eq!(handle.result().unwrap(), 42);
        bridge.shutdown();
    }

    #[test]
    fn start_is_idempotent() {
        let bridge = EventLoopBridge::new();
        bridge.start();
        bridge.start();
        assert!(bridge.is_running());
        let handle = bridge.run_coroutine(async { 1 }).unwrap();
        assert_eq!(handle.result().unwrap(), 1);
        bridge.shutdown();
    }

    #[test]
    fn scheduling_before_start_or_after_shutdown_is_refused() {
        let bridge = EventLoopBridge::new();
        assert!(bridge.run_coroutine(async {}).is_none());

        // Shutdown before start is a no-op...
        let bridge = EventLoopBridge::new();
        bridge.shutdown();
        bridge.start();
        assert!(bridge.is_running());

        // ...but after start it stops intake.
        bridge.shutdown();
        assert!(!bridge.is_running());
        assert!(bridge.run_coroutine(async {}).is_none());
    }

    #[test]
    fn panicking_coroutines_surface_through_the_handle() {
        let bridge = EventLoopBridge::new();
        bridge.start();
        let handle = bridge
            .run_coroutine(async {
                panic!("loop task failed");
            })
            .unwrap();
        match handle.result() {
            Err(Error::Job(JobError::Panicked(message))) => {
                assert!(message.contains("loop task failed"))
            }
            other => panic!("expected a panic error, got {other:?}"),
        }
        bridge.shutdown();
    }

    #[test]
    fn coroutines_can_be_scheduled_from_multiple_threads() {
        let bridge = EventLoopBridge::new();
        bridge.start();

        let mut joins = Vec::new();
        for n in 0..4u32 {
            let bridge = bridge.clone();
            joins.push(std::thread::spawn(move || {
                bridge
                    .run_coroutine(async move { n * 10 })
                    .unwrap()
                    .result()
                    .unwrap()
            }));
        }
        let mut results: Vec<u32> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, [0, 10, 20, 30]);
        bridge.shutdown();
    }
}
