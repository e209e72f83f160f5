//! # Event Bus
//!
//! Broadcast-based observer channel used by the sequencer and the orchestration
//! loop. Every component instance owns its own bus, so several sequencers can
//! coexist in one process (or one test) without seeing each other's events.
//!
//! Publishing never fails: an event with no subscribers is simply dropped.
//! Slow subscribers that fall behind the channel capacity receive
//! [`EventError::Lagged`] once and then continue from the newest events.

use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("Receiver lagged behind by {count} events")]
    Lagged { count: u64 },
    #[error("Event channel closed")]
    Closed,
    #[error("No event available")]
    Empty,
}

pub type EventResult<T> = Result<T, EventError>;

pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver<E> {
        EventReceiver::new(self.sender.subscribe())
    }

    /// Publishes an event and returns how many subscribers will see it.
    pub fn publish(&self, event: E) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                trace!("event dropped, no subscribers");
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

pub struct EventReceiver<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone + Send + 'static> EventReceiver<E> {
    fn new(receiver: broadcast::Receiver<E>) -> Self {
        Self { receiver }
    }

    /// Receives the next event. On lag the receiver is resubscribed and the
    /// lag is reported; the following call continues with fresh events.
    pub async fn recv(&mut self) -> EventResult<E> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }

    pub fn try_recv(&mut self) -> EventResult<E> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(event),
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(broadcast::error::TryRecvError::Empty) => Err(EventError::Empty),
            Err(broadcast::error::TryRecvError::Closed) => Err(EventError::Closed),
        }
    }

    /// Drains every event already queued for this receiver.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventError::Lagged { .. }) => continue,
                Err(_) => break,
            }
        }
        events
    }

    /// Converts the receiver into a stream, silently skipping lag notifications.
    pub fn into_stream(self) -> impl Stream<Item = E> {
        BroadcastStream::new(self.receiver).filter_map(|event| event.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Ping(u32),
    }

    #[tokio::test]
    async fn test_basic_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(TestEvent::Ping(1)), 1);
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Ping(1));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(TestEvent::Ping(7)), 2);
        assert_eq!(rx1.recv().await.unwrap(), TestEvent::Ping(7));
        assert_eq!(rx2.recv().await.unwrap(), TestEvent::Ping(7));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus: EventBus<TestEvent> = EventBus::new(4);
        assert_eq!(bus.publish(TestEvent::Ping(0)), 0);
    }

    #[tokio::test]
    async fn test_lagged_receiver_recovers() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(TestEvent::Ping(i));
        }

        assert!(matches!(rx.recv().await, Err(EventError::Lagged { .. })));
        bus.publish(TestEvent::Ping(99));
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Ping(99));
    }

    #[tokio::test]
    async fn test_drain_and_stream() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let stream_rx = bus.subscribe();
        bus.publish(TestEvent::Ping(1));
        bus.publish(TestEvent::Ping(2));

        assert_eq!(rx.drain(), vec![TestEvent::Ping(1), TestEvent::Ping(2)]);
        assert!(rx.drain().is_empty());

        let collected: Vec<_> = stream_rx.into_stream().take(2).collect().await;
        assert_eq!(collected, vec![TestEvent::Ping(1), TestEvent::Ping(2)]);
    }
}
