//! Lifetime-scoped bundle of the concurrency substrate.
//!
//! The original design kept module-level pool singletons; here the
//! application constructs one [`Runtime`] at startup, passes it down as a
//! dependency, and calls [`shutdown()`](Runtime::shutdown) from its
//! "application is shutting down" hook.

use crate::event_loop::EventLoopBridge;
use crate::executor::{CpuTaskExecutor, TaskExecutor};

/// Owns the thread pool, the CPU pool, and the event-loop bridge.
///
/// # Example
///
/// ```
/// use offload::Runtime;
///
/// let runtime = Runtime::new();
/// let handle = runtime.tasks().submit(|| "background work").unwrap();
/// assert_eq!(handle.result().unwrap(), "background work");
///
/// // From the application's shutdown hook:
/// runtime.shutdown();
/// assert!(runtime.tasks().submit(|| ()).is_none());
/// ```
pub struct Runtime {
    tasks: TaskExecutor,
    cpu_tasks: CpuTaskExecutor,
    event_loop: EventLoopBridge,
}

impl Runtime {
    /// Constructs the pools and starts the background event loop.
    pub fn new() -> Self {
        let event_loop = EventLoopBridge::new();
        event_loop.start();
        Self {
            tasks: TaskExecutor::default(),
            cpu_tasks: CpuTaskExecutor::new(),
            event_loop,
        }
    }

    /// The I/O-oriented thread pool.
    pub fn tasks(&self) -> &TaskExecutor {
        &self.tasks
    }

    /// The CPU-bound pool.
    pub fn cpu_tasks(&self) -> &CpuTaskExecutor {
        &self.cpu_tasks
    }

    /// The background event loop.
    pub fn event_loop(&self) -> &EventLoopBridge {
        &self.event_loop
    }

    /// The application shutdown hook: non-blocking.
    ///
    /// Both pools stop intake and abandon queued work, running jobs finish
    /// in the background, and the event loop is asked to stop
    /// cooperatively. Idempotent.
    pub fn shutdown(&self) {
        tracing::debug!("shutting down the background runtime");
        self.tasks.shutdown();
        self.cpu_tasks.shutdown();
        self.event_loop.shutdown();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_stops_every_facade() {
        let runtime = Runtime::new();
        assert_eq!(runtime.tasks().submit(|| 1).unwrap().result().unwrap(), 1);
        assert_eq!(
            runtime.cpu_tasks().submit(|| 2).unwrap().result().unwrap(),
            2
        );
        assert_eq!(
            runtime
                .event_loop()
                .run_coroutine(async { 3 })
                .unwrap()
                .result()
                .unwrap(),
            3
        );

        runtime.shutdown();
        assert!(runtime.tasks().submit(|| ()).is_none());
        assert!(runtime.cpu_tasks().submit(|| ()).is_none());
        assert!(runtime.event_loop().run_coroutine(async {}).is_none());

        // Idempotent.
        runtime.shutdown();
    }
}
