//! Tagged message pipe connecting a worker to its parent.
//!
//! A channel is a single-producer/single-consumer pipe carrying
//! [`Message`]s in strict FIFO order. The write end ([`Sink`]) is owned
//! exclusively by the worker side, the read end ([`Source`]) by the parent.
//! The bounded buffer provides natural backpressure: a producer that runs
//! ahead of its consumer blocks in [`Sink::push`].
//!
//! Exactly one terminal message (`Completed`, `Failed` or `Cancelled`) is
//! ever sent per channel, and it is always the last message. The terminal
//! senders consume the [`Sink`], so the type system rules out traffic after
//! termination.

use crate::cancellation_token::CancellationToken;
use crate::error::RemoteFailure;

/// A message travelling from a worker to its parent.
#[derive(Debug)]
pub enum Message<T> {
    /// A produced value.
    Value(T),
    /// A diagnostic line, logged by the parent and never counted as output.
    Debug(String),
    /// Terminal: the producer ran to natural exhaustion.
    Completed,
    /// Terminal: the producer failed; the failure travels as data.
    Failed(RemoteFailure),
    /// Terminal: the producer observed a cancellation request and stopped.
    Cancelled,
}

/// Error returned by [`Sink::push`] when the producer should stop.
///
/// Raised when cancellation has been requested, or when the parent has
/// released the read end (an early consumer break). Deliberately does not
/// implement `std::error::Error` so it converts into [`Halt`] unambiguously.
#[derive(Debug)]
pub struct Interrupted;

/// Control-flow result a producer returns through.
///
/// `Interrupted` bubbles up from [`Sink::push`] via `?`; any ordinary error
/// converts into `Failed`, capturing its type name as the failure kind.
///
/// ```
/// use offload::{Halt, Sink};
///
/// fn producer(sink: &mut Sink<u64>, input: &str) -> Result<(), Halt> {
///     let n: u64 = input.parse()?; // parse error becomes Halt::Failed
///     sink.push(n)?;               // cancellation becomes Halt::Interrupted
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub enum Halt {
    /// Stop producing; cancellation was requested or the consumer is gone.
    Interrupted,
    /// The producer failed.
    Failed(RemoteFailure),
}

impl From<Interrupted> for Halt {
    fn from(_: Interrupted) -> Self {
        Halt::Interrupted
    }
}

impl<E> From<E> for Halt
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        let mut failure = RemoteFailure::from_error(&error);
        failure.kind = core::any::type_name::<E>().to_string();
        Halt::Failed(failure)
    }
}

/// Error returned by [`Source::receive`] when the worker side is gone
/// without having sent a terminal message.
#[derive(Debug, thiserror::Error)]
#[error("channel disconnected before a terminal message")]
pub struct Disconnected;

/// Creates a connected channel pair sharing `token`.
///
/// `capacity` bounds the in-flight buffer; a zero capacity makes every
/// [`Sink::push`] rendezvous with a matching receive.
pub fn channel<T>(capacity: usize, token: CancellationToken) -> (Sink<T>, Source<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (Sink { tx, token }, Source { rx })
}

/// The worker-owned write end of a channel.
pub struct Sink<T> {
    tx: crossbeam_channel::Sender<Message<T>>,
    token: CancellationToken,
}

impl<T> Sink<T> {
    /// Sends a produced value, blocking if the buffer is full.
    ///
    /// After the value is delivered the cancellation latch is checked;
    /// `Err(Interrupted)` tells the producer to stop and return. The same
    /// signal is raised when the parent has dropped the [`Source`], which
    /// is how an early consumer break reaches a producer blocked mid-push.
    pub fn push(&mut self, value: T) -> Result<(), Interrupted> {
        if self.tx.send(Message::Value(value)).is_err() {
            return Err(Interrupted);
        }
        if self.token.is_requested() {
            return Err(Interrupted);
        }
        Ok(())
    }

    /// Sends a diagnostic line, tagged with the worker thread's name.
    ///
    /// Never terminates the stream and never counts as a produced value.
    pub fn debug(&self, text: impl Into<String>) {
        let line = match std::thread::current().name() {
            Some(name) => format!("{name}: {}", text.into()),
            None => text.into(),
        };
        let _ = self.tx.send(Message::Debug(line));
    }

    /// Returns `true` if cancellation has been requested.
    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_requested()
    }

    /// Terminal: the producer ran to exhaustion. Consumes the sink.
    pub fn complete(self) {
        let _ = self.tx.send(Message::Completed);
    }

    /// Terminal: the producer failed. Consumes the sink.
    pub fn fail(self, failure: RemoteFailure) {
        let _ = self.tx.send(Message::Failed(failure));
    }

    /// Terminal: the producer stopped on a cancellation request.
    /// Consumes the sink.
    pub fn cancelled(self) {
        let _ = self.tx.send(Message::Cancelled);
    }

    /// Releases the write end without sending a terminal message.
    pub fn close(self) {}
}

/// The parent-owned read end of a channel.
pub struct Source<T> {
    rx: crossbeam_channel::Receiver<Message<T>>,
}

impl<T> Source<T> {
    /// Blocking receive of the next message, in the exact order sent.
    pub fn receive(&self) -> Result<Message<T>, Disconnected> {
        self.rx.recv().map_err(|_| Disconnected)
    }

    /// Releases the read end; a producer blocked in [`Sink::push`] will
    /// observe [`Interrupted`] on its next send.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_arrive_in_push_order() {
        let (mut sink, source) = channel(8, CancellationToken::new());
        sink.push(1).unwrap();
        sink.debug("between values");
        sink.push(2).unwrap();
        sink.complete();

        assert!(matches!(source.receive().unwrap(), Message::Value(1)));
        assert!(matches!(source.receive().unwrap(), Message::Debug(_)));
        assert!(matches!(source.receive().unwrap(), Message::Value(2)));
        assert!(matches!(source.receive().unwrap(), Message::Completed));
        assert!(source.receive().is_err());
    }

    #[test]
    fn push_reports_interruption_after_cancellation() {
        let token = CancellationToken::new();
        let (mut sink, source) = channel(8, token.clone());
        sink.push(1).unwrap();
        token.request();
        assert!(sink.push(2).is_err());
        drop(source);
    }

    #[test]
    fn push_reports_interruption_when_source_is_dropped() {
        let (mut sink, source) = channel::<u32>(8, CancellationToken::new());
        drop(source);
        assert!(sink.push(1).is_err());
    }

    #[test]
    fn ordinary_errors_convert_into_halt_with_kind() {
        #[derive(Debug, thiserror::Error)]
        #[error("no such device")]
        struct DeviceError;

        fn fails() -> Result<(), Halt> {
            Err(DeviceError)?;
            Ok(())
        }
        match fails() {
            Err(Halt::Failed(failure)) => {
                assert!(failure.kind.contains("DeviceError"));
                assert_eq!(failure.message, "no such device");
                assert!(!failure.traceback.is_empty());
            }
            other => panic!("expected Halt::Failed, got {other:?}"),
        }
    }
}
