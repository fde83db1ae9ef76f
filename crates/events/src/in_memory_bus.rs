//! Channel-backed bus for tests and single-process deployments.

use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

/// The only way publishing can fail in-process.
#[derive(Debug)]
pub enum InMemoryBusError {
    /// The subscriber list lock was poisoned by a panicking thread.
    Poisoned,
}

/// Fan-out over std mpsc channels, one sender per subscriber.
///
/// Subscribers that have dropped their `Subscription` are pruned lazily on
/// the next publish. Delivery is at-least-once relative to the event store,
/// so consumers fold idempotently.
#[derive(Debug, Default)]
pub struct InMemoryEventBus<M> {
    senders: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut senders = self
            .senders
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_every_message() {
        let bus: InMemoryEventBus<u64> = InMemoryEventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish(7).unwrap();
        bus.publish(8).unwrap();

        assert_eq!(first.try_recv().unwrap(), 7);
        assert_eq!(first.try_recv().unwrap(), 8);
        assert_eq!(second.try_recv().unwrap(), 7);
        assert_eq!(second.try_recv().unwrap(), 8);
    }

    #[test]
    fn dropped_subscribers_do_not_break_publishing() {
        let bus: InMemoryEventBus<&'static str> = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish("still delivered").unwrap();
        assert_eq!(kept.try_recv().unwrap(), "still delivered");
    }
}
