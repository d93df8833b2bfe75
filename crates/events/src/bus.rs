//! Event publishing/subscription abstraction (mechanics only).
//!
//! Delivery is best-effort fan-out: every live subscription receives a copy
//! of each message published after it subscribed. Nothing is persisted; a
//! consumer that needs the authoritative state reads the job store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A subscription to an event stream.
///
/// ```ignore
/// let mut subscription = bus.subscribe();
/// while let Some(event) = subscription.recv().await {
///     handle(event);
/// }
/// ```
///
/// `recv` returns `None` once the bus is dropped.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for a message. `None` on timeout or when the bus
    /// is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<M> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Adapt into a `Stream` for combinator-style consumers.
    pub fn into_stream(self) -> UnboundedReceiverStream<M> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Transport-agnostic event bus.
///
/// Publishing never blocks; implementations must be safe to share across
/// tasks.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
