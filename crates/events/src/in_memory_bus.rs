//! Process-local fan-out over `std::sync::mpsc`: one sender per subscriber,
//! pruned on the first publish after its receiver is gone.

use std::sync::{Mutex, MutexGuard, mpsc::{self, Sender}};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("notification bus lock poisoned")]
    Poisoned,
}

/// Synchronous bus backing [`crate::Notifier`] when no external broker is wired in.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    senders: Mutex<Vec<Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self { senders: Mutex::new(Vec::new()) }
    }

    fn senders(&self) -> Result<MutexGuard<'_, Vec<Sender<M>>>, BusError> {
        self.senders.lock().map_err(|_| BusError::Poisoned)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send + 'static> EventBus<M> for InMemoryEventBus<M> {
    type Error = BusError;

    fn publish(&self, message: M) -> Result<(), BusError> {
        let mut senders = self.senders()?;
        senders.retain(|sender| sender.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (sender, receiver) = mpsc::channel();
        match self.senders() {
            Ok(mut senders) => senders.push(sender),
            // A poisoned bus hands out a subscription that never fires.
            Err(err) => tracing::warn!(error = %err, "subscriber not registered"),
        }
        Subscription::new(receiver)
    }

    fn subscriber_count(&self) -> usize {
        self.senders().map_or(0, |senders| senders.len())
    }
}
