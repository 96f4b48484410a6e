//! Concurrency substrate for offloading and streaming work off a GUI or
//! other main thread.
//!
//! # Components
//!
//! - **TaskExecutor / CpuTaskExecutor**: job pools with future-like
//!   [`JobHandle`]s, sized for I/O-bound and CPU-bound work respectively
//! - **StreamingWorker**: runs a producer function on an isolated worker
//!   and exposes its output as a single-use, cancellable iterator
//! - **EventLoopBridge**: a background event loop for running futures from
//!   synchronous call sites
//! - **Runtime**: a lifetime-scoped bundle of the above with one
//!   non-blocking shutdown hook
//!
//! # Example
//!
//! ```
//! use offload::StreamingWorker;
//!
//! // A long-running scan, produced on an isolated worker thread and
//! // consumed lazily on this one.
//! let scan = StreamingWorker::<u32>::builder()
//!     .name("page-scan")
//!     .build(|sink| {
//!         for page in 0..100u32 {
//!             sink.push(page)?;
//!         }
//!         Ok(())
//!     });
//!
//! for page in scan.iterate().unwrap().take(10) {
//!     let page = page.unwrap();
//!     // hand the page to the UI...
//!     # let _ = page;
//! }
//! // Dropping the iterator joined the worker and released the channel.
//! ```

pub mod cancellation_token;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod job_handle;
pub mod runtime;
pub mod streaming_worker;

// Re-export commonly used types at crate root
pub use cancellation_token::CancellationToken;
pub use channel::{Halt, Interrupted, Message, Sink, Source, channel};
pub use error::{Error, RemoteFailure, Result};
pub use event_loop::EventLoopBridge;
pub use executor::{CpuTaskExecutor, TaskExecutor, call_threaded};
pub use job_handle::{JobError, JobHandle, JobResult};
pub use runtime::Runtime;
pub use streaming_worker::{StreamingWorker, Values, WorkerState};

/// Returns the number of available hardware threads.
///
/// Queries the OS via `std::thread::available_parallelism()`, falling back
/// to 1 if the query fails.
pub fn available_parallelism() -> core::num::NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(core::num::NonZeroUsize::new(1).unwrap())
}
