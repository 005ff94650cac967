//! Publish/subscribe abstraction (mechanics only).
//!
//! Delivery is **best-effort broadcast**:
//!
//! - Every live subscriber gets a copy of every message published after it subscribed
//! - Subscribers that went away are dropped silently on the next publish
//! - Nothing is persisted; late subscribers miss earlier messages
//!
//! Observers must therefore treat notifications as hints and re-read the job store
//! when they need authoritative state.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a notification stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(msg) => render(msg),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Bus closed
///     }
/// }
/// ```
///
/// Publishing never blocks on a subscriber, so a slow observer only grows its own
/// backlog. Dropping the subscription unsubscribes.
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

    /// Take everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic broadcast bus.
///
/// Every live subscription gets its own copy of each published message; nothing
/// is replayed to subscriptions created later. A dropped [`Subscription`] still
/// counts towards `subscriber_count` until the next `publish` notices it and
/// forgets it. `publish` can fail on a poisoned bus, which callers on the hot
/// path log and move past.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;
    fn subscribe(&self) -> Subscription<M>;
    fn subscriber_count(&self) -> usize;
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

    fn subscriber_count(&self) -> usize {
        (**self).subscriber_count()
    }
}
