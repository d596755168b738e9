//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the transport that buffered job events are flushed to once a run
//! succeeds. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, a broker client, etc.
//! - **At-least-once delivery**: consumers must be idempotent
//! - **No persistence**: the bus distributes, it does not store

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Meant for consumption by a single thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Pub/sub transport for outbound events.
///
/// `publish()` can fail (bus full, network error). The failure is surfaced to
/// the caller, which for job runs means the dispatch is reported as failed.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    /// Publish `messages` in order. Returns how many were published.
    ///
    /// The default publishes one at a time and stops at the first failure,
    /// so a transport without batch support may have delivered a prefix.
    /// [`BatchError::sent`] says how long that prefix is. Transports that
    /// can publish a batch all-or-nothing should override this.
    fn publish_batch(&self, messages: Vec<M>) -> Result<usize, BatchError<Self::Error>> {
        let mut sent = 0;
        for message in messages {
            self.publish(message).map_err(|error| BatchError { sent, error })?;
            sent += 1;
        }
        Ok(sent)
    }

    fn subscribe(&self) -> Subscription<M>;
}

/// A batch publish that stopped after `sent` messages.
#[derive(Debug)]
pub struct BatchError<E> {
    pub sent: usize,
    pub error: E,
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn publish_batch(&self, messages: Vec<M>) -> Result<usize, BatchError<Self::Error>> {
        (**self).publish_batch(messages)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
