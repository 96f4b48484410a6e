//! Blocking, future-like handles for submitted jobs.
//!
//! A [`JobHandle`] represents one unit of work queued on an executor or the
//! event-loop bridge. The caller may block on [`result()`](JobHandle::result),
//! poll with a timeout, or register a completion callback; the pool keeps no
//! reference to the handle once the job is queued.
//!
//! Internally this is a promise: shared state behind a `Mutex` + `Condvar`
//! pair. The executing side completes it through a [`Completion`] guard
//! whose `Drop` resolves the handle to [`JobError::Abandoned`] if the job is
//! discarded before running, so a caller blocked on `result()` can never be
//! left waiting forever.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use trace_err::*;

use crate::error::Error;

/// Why a job produced no value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The job panicked while executing; the payload text is preserved.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was dropped before it ran, typically because its pool shut
    /// down while it was still queued.
    #[error("job abandoned before completion")]
    Abandoned,
}

/// The outcome delivered to a completed handle.
pub type JobResult<T> = Result<T, JobError>;

type DoneCallback<T> = Box<dyn FnOnce(&JobResult<T>) + Send>;

enum State<T> {
    Pending(Vec<DoneCallback<T>>),
    // The slot is only ever None after result() has consumed the value.
    Done(Option<JobResult<T>>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn complete(&self, result: JobResult<T>) {
        let mut state = self.state.lock().trace_expect("Failed to lock mutex");
        let callbacks = match core::mem::replace(&mut *state, State::Done(Some(result))) {
            State::Pending(callbacks) => callbacks,
            // Already completed; keep the first outcome.
            prior @ State::Done(_) => {
                *state = prior;
                return;
            }
        };
        self.cond.notify_all();
        if let State::Done(Some(result)) = &*state {
            for callback in callbacks {
                callback(result);
            }
        }
    }
}

/// Creates a connected completion guard and handle pair.
pub(crate) fn job_handle_pair<T>() -> (Completion<T>, JobHandle<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(Vec::new())),
        cond: Condvar::new(),
    });
    (
        Completion {
            shared: shared.clone(),
            fulfilled: false,
        },
        JobHandle { shared },
    )
}

/// The executing side of a job: fulfills the connected [`JobHandle`].
///
/// Dropping an unfulfilled guard resolves the handle to
/// [`JobError::Abandoned`].
pub(crate) struct Completion<T> {
    shared: Arc<Shared<T>>,
    fulfilled: bool,
}

impl<T> Completion<T> {
    pub(crate) fn fulfill(mut self, result: JobResult<T>) {
        self.fulfilled = true;
        self.shared.complete(result);
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.shared.complete(Err(JobError::Abandoned));
        }
    }
}

/// A handle to one submitted unit of work.
pub struct JobHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> JobHandle<T> {
    /// Blocks until the job completes and returns its value.
    ///
    /// Re-raises the job's failure: a panicking job surfaces as
    /// [`JobError::Panicked`], an abandoned one as [`JobError::Abandoned`].
    pub fn result(self) -> crate::Result<T> {
        self.wait(None)
    }

    /// Like [`result()`](JobHandle::result) with an upper bound on the wait.
    pub fn result_timeout(self, timeout: Duration) -> crate::Result<T> {
        self.wait(Some(timeout))
    }

    /// Returns `true` if the job has completed (by any outcome).
    pub fn is_finished(&self) -> bool {
        matches!(
            &*self.shared.state.lock().trace_expect("Failed to lock mutex"),
            State::Done(_)
        )
    }

    /// Registers a callback invoked with the job's outcome on completion.
    ///
    /// If the job has already completed, the callback runs immediately on
    /// the calling thread. Callbacks are invoked while the handle's internal
    /// lock is held and must not block on the same handle.
    pub fn add_done_callback(&self, callback: impl FnOnce(&JobResult<T>) + Send + 'static) {
        let mut state = self.shared.state.lock().trace_expect("Failed to lock mutex");
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(callback)),
            State::Done(Some(result)) => callback(result),
            State::Done(None) => {
                tracing::debug!("done callback registered after the result was consumed");
            }
        }
    }

    fn wait(self, timeout: Option<Duration>) -> crate::Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock().trace_expect("Failed to lock mutex");
        loop {
            if let State::Done(slot) = &mut *state {
                return match slot.take() {
                    Some(Ok(value)) => Ok(value),
                    Some(Err(e)) => Err(Error::Job(e)),
                    None => Err(Error::Job(JobError::Abandoned)),
                };
            }
            match deadline {
                None => {
                    state = self
                        .shared
                        .cond
                        .wait(state)
                        .trace_expect("Failed to lock mutex");
                }
                Some(deadline) => {
                    let Some(remaining) = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|r| !r.is_zero())
                    else {
                        return Err(Error::ResultTimeout);
                    };
                    let (guard, _) = self
                        .shared
                        .cond
                        .wait_timeout(state, remaining)
                        .trace_expect("Failed to lock mutex");
                    state = guard;
                }
            }
        }
    }
}

/// Renders a panic payload as text for transport or logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn result_returns_fulfilled_value() {
        let (completion, handle) = job_handle_pair();
        completion.fulfill(Ok(7));
        assert!(handle.is_finished());
        assert_eq!(handle.result().unwrap(), 7);
    }

    #[test]
    fn dropping_the_completion_resolves_abandoned() {
        let (completion, handle) = job_handle_pair::<u32>();
        drop(completion);
        assert!(matches!(
            handle.result(),
            Err(Error::Job(JobError::Abandoned))
        ));
    }

    #[test]
    fn result_timeout_expires_while_pending() {
        let (_completion, handle) = job_handle_pair::<u32>();
        assert!(matches!(
            handle.result_timeout(Duration::from_millis(20)),
            Err(Error::ResultTimeout)
        ));
    }

    #[test]
    fn callbacks_fire_on_completion_and_immediately_after() {
        let fired = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicBool::new(false));

        let (completion, handle) = job_handle_pair();
        let fired2 = fired.clone();
        handle.add_done_callback(move |result| {
            assert!(matches!(result, Ok(3)));
            fired2.store(true, Ordering::SeqCst);
        });
        completion.fulfill(Ok(3));
        assert!(fired.load(Ordering::SeqCst));

        let late2 = late.clone();
        handle.add_done_callback(move |_| late2.store(true, Ordering::SeqCst));
        assert!(late.load(Ordering::SeqCst));
    }
}
