//! Isolated producer exposed as a single-use, cancellable iterator.
//!
//! A [`StreamingWorker`] runs a caller-supplied producer function on a
//! dedicated, named worker thread and exposes its output as a lazy, finite,
//! single-pass iterator with cooperative cancellation and full fault
//! containment: a failure on the worker side can never propagate as a raw
//! crash and can never leave the parent blocked.
//!
//! The producer receives the write end of a [channel](crate::channel) and
//! calls [`push`](crate::Sink::push) per item. Each push delivers the value
//! and then checks the shared cancellation latch; on a request the producer
//! unwinds cooperatively and the worker sends a terminal `Cancelled`. Any
//! error returned by the producer, and any panic anywhere inside it, is
//! caught at the outermost frame of the worker thread and converted into a
//! terminal `Failed` message.
//!
//! # Lifecycle
//!
//! `Created → Running → {Completed | Failed | Cancelled} → Closed`
//!
//! The worker thread starts only on the first call to
//! [`iterate()`](StreamingWorker::iterate) (lazy launch) and a second call
//! always fails, regardless of how the first iteration ended. `Closed` is
//! entered unconditionally when iteration ends on every exit path: normal
//! exhaustion, failure, cancellation, or an early consumer break.
//!
//! # Example
//!
//! ```
//! use offload::StreamingWorker;
//!
//! let worker = StreamingWorker::new(|sink| {
//!     for n in [1u64, 4, 9] {
//!         sink.push(n.isqrt())?;
//!     }
//!     Ok(())
//! });
//!
//! let roots: Vec<u64> = worker
//!     .iterate()
//!     .unwrap()
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(roots, [1, 2, 3]);
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use trace_err::*;

use crate::cancellation_token::CancellationToken;
use crate::channel::{self, Halt, Message, Sink, Source};
use crate::error::{Error, RemoteFailure};
use crate::executor::TaskExecutor;
use crate::job_handle::{JobHandle, panic_message};

/// Observable lifecycle state of a [`StreamingWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Constructed; the worker thread has not been started.
    Created = 0,
    /// The worker thread is producing values.
    Running = 1,
    /// The producer ran to natural exhaustion.
    Completed = 2,
    /// The producer failed; the failure was surfaced to the consumer.
    Failed = 3,
    /// The producer stopped on a cancellation request.
    Cancelled = 4,
    /// The channel is released and the worker thread joined.
    Closed = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Completed,
            3 => WorkerState::Failed,
            4 => WorkerState::Cancelled,
            _ => WorkerState::Closed,
        }
    }
}

type Producer<T> = Box<dyn FnOnce(&mut Sink<T>) -> Result<(), Halt> + Send>;
type DoneCallback = Box<dyn FnOnce() + Send>;

const OUTCOME_NONE: u8 = u8::MAX;

struct SharedState {
    state: AtomicU8,
    outcome: AtomicU8,
    done_callback: Mutex<Option<DoneCallback>>,
}

impl SharedState {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Configures and builds a [`StreamingWorker`].
#[derive(Clone)]
pub struct Builder {
    name: String,
    capacity: usize,
    cancellable: bool,
}

impl Builder {
    /// Sets the worker thread's name; also used to tag debug messages.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the channel buffer size.
    ///
    /// The bound provides backpressure: a producer that runs ahead of its
    /// consumer by more than `capacity` items blocks in `push`.
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Marks the worker as non-cancellable; `cancel()` will then fail.
    pub fn cancellable(self, cancellable: bool) -> Self {
        Self { cancellable, ..self }
    }

    /// Builds a worker around `producer`. The thread is not started here.
    pub fn build<T, F>(self, producer: F) -> StreamingWorker<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Sink<T>) -> Result<(), Halt> + Send + 'static,
    {
        StreamingWorker {
            producer: Mutex::new(Some(Box::new(producer))),
            token: CancellationToken::new(),
            cancellable: self.cancellable,
            capacity: self.capacity,
            name: self.name,
            shared: Arc::new(SharedState {
                state: AtomicU8::new(WorkerState::Created as u8),
                outcome: AtomicU8::new(OUTCOME_NONE),
                done_callback: Mutex::new(None),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: "streaming-worker".to_string(),
            capacity: 16,
            cancellable: true,
        }
    }
}

/// Runs a producer on an isolated worker thread and exposes its output as a
/// single-pass iterator. See the [module docs](self) for the full contract.
pub struct StreamingWorker<T> {
    producer: Mutex<Option<Producer<T>>>,
    token: CancellationToken,
    cancellable: bool,
    capacity: usize,
    name: String,
    shared: Arc<SharedState>,
}

impl<T: Send + 'static> StreamingWorker<T> {
    /// Builds a cancellable worker with default settings.
    pub fn new<F>(producer: F) -> Self
    where
        F: FnOnce(&mut Sink<T>) -> Result<(), Halt> + Send + 'static,
    {
        Builder::default().build(producer)
    }

    /// Returns a builder for configuring name, capacity and cancellability.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Requests cooperative cancellation.
    ///
    /// Takes effect the next time the producer pushes a value; work inside
    /// a single production step cannot be preempted. Fails with
    /// [`Error::NotCancellable`] on a worker built with `cancellable(false)`.
    pub fn cancel(&self) -> crate::Result<()> {
        if !self.cancellable {
            return Err(Error::NotCancellable);
        }
        self.token.request();
        Ok(())
    }

    /// Returns `true` if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_requested()
    }

    /// Returns the shared cancellation latch.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Registers a callback fired only when the producer completes
    /// naturally. Failure and cancellation do not fire it.
    pub fn add_done_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self
            .shared
            .done_callback
            .lock()
            .trace_expect("Failed to lock mutex") = Some(Box::new(callback));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// How the stream terminated, once it has.
    pub fn outcome(&self) -> Option<WorkerState> {
        match self.shared.outcome.load(Ordering::Acquire) {
            OUTCOME_NONE => None,
            value => Some(WorkerState::from_u8(value)),
        }
    }

    /// Starts the worker thread and returns the value iterator.
    ///
    /// May be called at most once per instance; a second call fails with
    /// [`Error::AlreadyIterated`] regardless of how the first iteration
    /// ended. The worker thread is never started if this is never called.
    pub fn iterate(&self) -> crate::Result<Values<T>> {
        let producer = self
            .producer
            .lock()
            .trace_expect("Failed to lock mutex")
            .take()
            .ok_or(Error::AlreadyIterated)?;

        let (sink, source) = channel::channel(self.capacity, self.token.clone());
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_producer(producer, sink))?;

        self.shared.set_state(WorkerState::Running);
        Ok(Values {
            source: Some(source),
            join: Some(join),
            shared: self.shared.clone(),
            finished: false,
        })
    }

    /// Runs the iteration on `pool`, invoking `callback` per produced value.
    ///
    /// This is the one place the otherwise-blocking iteration is made
    /// asynchronous. Returns `Ok(None)` if the pool rejected the submission
    /// (shutdown in progress). A remote failure, or a panic raised by the
    /// callback, propagates through the returned handle rather than being
    /// swallowed.
    pub fn map<F>(
        &self,
        pool: &TaskExecutor,
        mut callback: F,
    ) -> crate::Result<Option<JobHandle<crate::Result<()>>>>
    where
        F: FnMut(T) + Send + 'static,
    {
        let values = self.iterate()?;
        Ok(pool.submit(move || {
            for value in values {
                callback(value?);
            }
            Ok(())
        }))
    }
}

/// Outermost frame of the worker thread.
///
/// Converts every exit of the producer into exactly one terminal message:
/// `Completed` on natural return, `Cancelled` on interruption, `Failed` on
/// a returned error or a panic. The thread itself never terminates with an
/// unhandled panic.
fn run_producer<T>(producer: Producer<T>, mut sink: Sink<T>) {
    match catch_unwind(AssertUnwindSafe(|| producer(&mut sink))) {
        Ok(Ok(())) => sink.complete(),
        Ok(Err(Halt::Interrupted)) => sink.cancelled(),
        Ok(Err(Halt::Failed(failure))) => sink.fail(failure),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            sink.fail(RemoteFailure {
                kind: "panic".to_string(),
                message: message.clone(),
                traceback: format!(
                    "{message}\n{}",
                    std::backtrace::Backtrace::force_capture()
                ),
            });
        }
    }
}

/// Single-pass iterator over a worker's produced values.
///
/// Yields `Ok` per value and at most one `Err` carrying a
/// [`RemoteFailure`]. Whatever way iteration ends, including dropping the
/// iterator mid-stream, the channel is released and the worker thread
/// joined before control returns.
pub struct Values<T> {
    source: Option<Source<T>>,
    join: Option<thread::JoinHandle<()>>,
    shared: Arc<SharedState>,
    finished: bool,
}

impl<T> Values<T> {
    fn finish(&mut self, outcome: WorkerState) {
        self.finished = true;
        self.shared.outcome.store(outcome as u8, Ordering::Release);
        self.shared.set_state(outcome);
        self.cleanup();
    }

    // Idempotent: releases the channel, joins the thread, enters Closed.
    fn cleanup(&mut self) {
        if self.source.is_none() && self.join.is_none() {
            return;
        }
        // Dropping the source first unblocks a producer waiting in push().
        drop(self.source.take());
        if let Some(join) = self.join.take() {
            // run_producer catches panics, so the join itself cannot fail.
            let _ = join.join();
        }
        self.shared.set_state(WorkerState::Closed);
    }
}

impl<T> Iterator for Values<T> {
    type Item = crate::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let Some(source) = self.source.as_ref() else {
                return None;
            };
            match source.receive() {
                Ok(Message::Value(value)) => return Some(Ok(value)),
                Ok(Message::Debug(line)) => {
                    tracing::debug!("remote worker: {line}");
                }
                Ok(Message::Completed) => {
                    let callback = self
                        .shared
                        .done_callback
                        .lock()
                        .trace_expect("Failed to lock mutex")
                        .take();
                    self.finish(WorkerState::Completed);
                    if let Some(callback) = callback {
                        callback();
                    }
                    return None;
                }
                Ok(Message::Cancelled) => {
                    self.finish(WorkerState::Cancelled);
                    return None;
                }
                Ok(Message::Failed(failure)) => {
                    tracing::error!(
                        "remote worker failed: {failure}\nTraceback:\n{}",
                        failure.traceback
                    );
                    self.finish(WorkerState::Failed);
                    return Some(Err(Error::Remote(failure)));
                }
                Err(_) => {
                    // The worker died without a terminal message.
                    tracing::warn!("worker channel closed without a terminal message");
                    self.finish(WorkerState::Failed);
                    return None;
                }
            }
        }
    }
}

impl<T> Drop for Values<T> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    #[derive(Debug, thiserror::Error)]
    #[error("cannot take the square root of {0}")]
    struct NegativeInput(i64);

    fn sqrt_producer(inputs: Vec<i64>) -> impl FnOnce(&mut Sink<i64>) -> Result<(), Halt> {
        move |sink| {
            for n in inputs {
                if n < 0 {
                    return Err(NegativeInput(n).into());
                }
                sink.push((n as f64).sqrt() as i64)?;
            }
            Ok(())
        }
    }

    #[test]
    fn yields_the_same_sequence_as_the_producer() {
        let worker = StreamingWorker::new(sqrt_producer(vec![1, 4, 9, 16, 25]));
        let values: Vec<i64> = worker
            .iterate()
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();
        assert_eq!(values, [1, 2, 3, 4, 5]);
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(worker.outcome(), Some(WorkerState::Completed));
    }

    #[test]
    fn failure_on_the_first_item_raises_a_remote_failure() {
        init_logging();
        let worker = StreamingWorker::new(sqrt_producer(vec![-16, -4, -1]));
        let mut values = worker.iterate().unwrap();
        match values.next() {
            Some(Err(Error::Remote(failure))) => {
                assert!(failure.kind.contains("NegativeInput"));
                assert!(!failure.traceback.is_empty());
            }
            other => panic!("expected a remote failure, got {other:?}"),
        }
        assert!(values.next().is_none());
        drop(values);
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(worker.outcome(), Some(WorkerState::Failed));
    }

    #[test]
    fn failure_at_the_kth_item_yields_the_first_k_minus_one_values() {
        let worker = StreamingWorker::new(sqrt_producer(vec![1, 4, -9, 16]));
        let mut values = worker.iterate().unwrap();
        assert_eq!(values.next().unwrap().unwrap(), 1);
        assert_eq!(values.next().unwrap().unwrap(), 2);
        assert!(matches!(values.next(), Some(Err(Error::Remote(_)))));
        assert!(values.next().is_none());
    }

    #[test]
    fn second_iteration_always_fails() {
        let worker = StreamingWorker::new(sqrt_producer(vec![1, 4]));
        worker.iterate().unwrap().for_each(drop);
        assert!(matches!(worker.iterate(), Err(Error::AlreadyIterated)));

        // Same after a failed run.
        let worker = StreamingWorker::new(sqrt_producer(vec![-1]));
        worker.iterate().unwrap().for_each(drop);
        assert!(matches!(worker.iterate(), Err(Error::AlreadyIterated)));
    }

    #[test]
    fn cancel_before_consuming_terminates_cleanly() {
        let worker = StreamingWorker::new(|sink: &mut Sink<u64>| {
            for n in 0.. {
                sink.push(n)?;
            }
            Ok(())
        });
        worker.cancel().unwrap();
        let values: Vec<u64> = worker
            .iterate()
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();
        // Zero or more values, then clean termination.
        assert!(values.len() <= 1);
        assert!(worker.is_cancelled());
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(worker.outcome(), Some(WorkerState::Cancelled));
    }

    #[test]
    fn early_consumer_break_still_cleans_up() {
        let worker = StreamingWorker::<u64>::builder()
            .capacity(1)
            .build(|sink: &mut Sink<u64>| {
                for n in 0.. {
                    sink.push(n)?;
                }
                Ok(())
            });
        let mut values = worker.iterate().unwrap();
        assert_eq!(values.next().unwrap().unwrap(), 0);
        drop(values);
        assert_eq!(worker.state(), WorkerState::Closed);
    }

    #[test]
    fn cancel_on_a_non_cancellable_worker_fails() {
        let worker = StreamingWorker::<i64>::builder()
            .cancellable(false)
            .build(sqrt_producer(vec![1]));
        assert!(matches!(worker.cancel(), Err(Error::NotCancellable)));
        // The stream itself is unaffected.
        let values: Vec<i64> = worker
            .iterate()
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();
        assert_eq!(values, [1]);
    }

    #[test]
    fn done_callback_fires_only_on_completion() {
        let fired = Arc::new(AtomicBool::new(false));

        let worker = StreamingWorker::new(sqrt_producer(vec![1, 4]));
        let fired2 = fired.clone();
        worker.add_done_callback(move || fired2.store(true, Ordering::SeqCst));
        worker.iterate().unwrap().for_each(drop);
        assert!(fired.load(Ordering::SeqCst));

        let fired = Arc::new(AtomicBool::new(false));
        let worker = StreamingWorker::new(sqrt_producer(vec![-1]));
        let fired2 = fired.clone();
        worker.add_done_callback(move || fired2.store(true, Ordering::SeqCst));
        worker.iterate().unwrap().for_each(drop);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn debug_messages_do_not_count_as_values() {
        init_logging();
        let worker = StreamingWorker::new(|sink: &mut Sink<u32>| {
            sink.debug("starting scan");
            sink.push(10)?;
            sink.debug("halfway");
            sink.push(20)?;
            Ok(())
        });
        let values: Vec<u32> = worker
            .iterate()
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();
        assert_eq!(values, [10, 20]);
    }

    #[test]
    fn producer_panic_becomes_a_remote_failure() {
        let worker = StreamingWorker::new(|sink: &mut Sink<u32>| {
            sink.push(1)?;
            panic!("scanner exploded");
        });
        let mut values = worker.iterate().unwrap();
        assert_eq!(values.next().unwrap().unwrap(), 1);
        match values.next() {
            Some(Err(Error::Remote(failure))) => {
                assert_eq!(failure.kind, "panic");
                assert!(failure.message.contains("scanner exploded"));
                assert!(!failure.traceback.is_empty());
            }
            other => panic!("expected a remote failure, got {other:?}"),
        }
    }

    #[test]
    fn lazy_launch_does_not_start_until_iterated() {
        let started = Arc::new(AtomicBool::new(false));
        let started2 = started.clone();
        let worker = StreamingWorker::new(move |_sink: &mut Sink<u32>| {
            started2.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(worker.state(), WorkerState::Created);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!started.load(Ordering::SeqCst));
        worker.iterate().unwrap().for_each(drop);
        assert!(started.load(Ordering::SeqCst));
    }

    #[test]
    fn map_invokes_the_callback_per_value() {
        let pool = TaskExecutor::default();
        let collected = Arc::new(Mutex::new(Vec::new()));

        let worker = StreamingWorker::new(sqrt_producer(vec![1, 4, 9]));
        let sink = collected.clone();
        let handle = worker
            .map(&pool, move |value| sink.lock().unwrap().push(value))
            .unwrap()
            .unwrap();
        handle.result().unwrap().unwrap();
        assert_eq!(*collected.lock().unwrap(), [1, 2, 3]);
        assert!(matches!(worker.iterate(), Err(Error::AlreadyIterated)));
    }

    #[test]
    fn map_propagates_remote_failures_through_the_handle() {
        let pool = TaskExecutor::default();
        let worker = StreamingWorker::new(sqrt_producer(vec![1, -4]));
        let handle = worker.map(&pool, |_| {}).unwrap().unwrap();
        assert!(matches!(
            handle.result().unwrap(),
            Err(Error::Remote(_))
        ));
    }
}
