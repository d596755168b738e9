//! In-memory event bus for tests/dev.

use std::collections::VecDeque;
use std::sync::{Mutex, mpsc};

use crate::bus::{BatchError, EventBus, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - Best-effort fan-out to live subscribers
/// - Keeps a copy of every published message, in publish order, so callers
///   can inspect what went out without racing a subscriber thread
/// - History can be capped for long-running processes
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
    history: Mutex<VecDeque<M>>,
    history_limit: Option<usize>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` messages of history, dropping the oldest.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    /// Every message published so far, oldest first.
    pub fn published(&self) -> Vec<M> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Fan out and record `messages` under both locks, so a batch is either
    /// delivered whole or not at all.
    fn deliver(&self, messages: Vec<M>) -> Result<usize, InMemoryBusError> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let mut history = self.history.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let count = messages.len();
        for message in messages {
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
            history.push_back(message);
        }
        if let Some(limit) = self.history_limit {
            while history.len() > limit {
                history.pop_front();
            }
        }

        Ok(count)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: None,
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.deliver(vec![message]).map(|_| ())
    }

    fn publish_batch(&self, messages: Vec<M>) -> Result<usize, BatchError<Self::Error>> {
        self.deliver(messages).map_err(|error| BatchError { sent: 0, error })
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_in_publish_order() {
        let bus = InMemoryEventBus::<u32>::new();
        let sub = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(sub.drain(), vec![1, 2]);
        assert_eq!(bus.published(), vec![1, 2]);
    }

    #[test]
    fn dropped_subscribers_do_not_block_publish() {
        let bus = InMemoryEventBus::<u32>::new();
        drop(bus.subscribe());

        bus.publish(7).unwrap();
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn history_limit_keeps_newest() {
        let bus = InMemoryEventBus::<u32>::new().with_history_limit(2);
        let sub = bus.subscribe();

        for n in 1..=4 {
            bus.publish(n).unwrap();
        }

        assert_eq!(bus.published(), vec![3, 4]);
        assert_eq!(sub.drain(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn batch_is_delivered_in_order() {
        let bus = InMemoryEventBus::<u32>::new();
        let sub = bus.subscribe();

        assert_eq!(bus.publish_batch(vec![1, 2, 3]).unwrap(), 3);
        assert_eq!(sub.drain(), vec![1, 2, 3]);
        assert_eq!(bus.published(), vec![1, 2, 3]);
    }

    #[test]
    fn poisoned_bus_rejects_the_whole_batch() {
        let bus = std::sync::Arc::new(InMemoryEventBus::<u32>::new());
        let sub = bus.subscribe();
        let poisoner = bus.clone();
        let _ = std::thread::spawn(move || {
            let _history = poisoner.history.lock().unwrap();
            panic!("poison history");
        })
        .join();

        let err = bus.publish_batch(vec![1, 2]).unwrap_err();
        assert_eq!(err.sent, 0);
        assert_eq!(err.error, InMemoryBusError::Poisoned);
        assert!(sub.drain().is_empty());
    }
}
