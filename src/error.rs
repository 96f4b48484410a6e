//! Crate-wide error taxonomy.
//!
//! Failures that cross the worker boundary are carried as a structured
//! [`RemoteFailure`] rather than an attempt to reconstruct the original
//! error type on the parent side.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Cancellation was requested on a worker built with
    /// `cancellable(false)`.
    #[error("operation is not cancellable")]
    NotCancellable,

    /// A streaming worker was iterated a second time, regardless of how
    /// the first iteration ended.
    #[error("a streaming worker can only be iterated once")]
    AlreadyIterated,

    /// A failure that occurred on the worker side of a channel.
    #[error(transparent)]
    Remote(#[from] RemoteFailure),

    /// A submitted job panicked or was abandoned before it started.
    #[error(transparent)]
    Job(#[from] crate::job_handle::JobError),

    /// A blocking wait for a job result exceeded its timeout.
    #[error("timed out waiting for a result")]
    ResultTimeout,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
}

/// A failure raised inside a worker, carried back to the parent as data.
///
/// `kind` classifies the failure (the error's type name, or `"panic"`),
/// `message` is its rendered display text, and `traceback` holds the full
/// cause chain or captured backtrace. The traceback is logged on the parent
/// side before the failure is surfaced to the caller.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RemoteFailure {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl RemoteFailure {
    /// Builds a failure record from any error, capturing its type name as
    /// the kind and its source chain as the traceback text.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut traceback = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            traceback.push_str("\ncaused by: ");
            traceback.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            kind: "error".to_string(),
            message: error.to_string(),
            traceback,
        }
    }
}
