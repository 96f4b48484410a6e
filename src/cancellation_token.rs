//! One-way cancellation latch shared between a worker and its parent.
//!
//! The token is a monotonic boolean: [`request()`](CancellationToken::request)
//! sets it permanently and there is no reset. Reads never block, so a
//! producer can poll the latch between items without synchronization cost.
//!
//! # Example
//!
//! ```
//! use offload::CancellationToken;
//!
//! let token = CancellationToken::new();
//! assert!(!token.is_requested());
//!
//! token.request();
//! token.request(); // idempotent
//! assert!(token.is_requested());
//! ```

/// A one-way latch observable from both sides of a worker boundary.
///
/// Wraps `tokio_util::sync::CancellationToken` so the same latch serves
/// synchronous polls from worker threads and the async stop path of the
/// event-loop bridge. Clones share the underlying latch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(tokio_util::sync::CancellationToken);

impl CancellationToken {
    /// Creates a new, unset token.
    pub fn new() -> Self {
        Self(tokio_util::sync::CancellationToken::new())
    }

    /// Requests cancellation.
    ///
    /// Idempotent; once set the token stays set for its lifetime.
    pub fn request(&self) {
        self.0.cancel();
    }

    /// Returns `true` if cancellation has been requested.
    ///
    /// Never blocks.
    pub fn is_requested(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Completes when cancellation is requested.
    ///
    /// Used where the latch is observed from async code, such as the
    /// event-loop bridge stop path.
    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}
