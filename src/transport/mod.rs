//! Transport layer for the sensor feed
//!
//! The connection manager talks to the broker only through the
//! [`Transport`] trait. Each connection attempt uses a fresh handle obtained
//! from a [`TransportFactory`]; handles push their events into a shared
//! queue tagged with the handle's generation so the manager can discard
//! events from handles it has already torn down.

use crate::config::{Credentials, Endpoint};
use tokio::sync::mpsc;

pub mod mqtt;

/// Delivery guarantee requested when subscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryQos {
    /// QoS 0: best effort, no redelivery
    AtMostOnce,
}

/// Push-style notifications from a live transport handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message arrived on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// An established connection was lost
    ConnectionLost { reason: String },
}

/// A [`TransportEvent`] tagged with the generation of the handle that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sending half handed to each transport handle
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::Sender<TaggedEvent>,
}

impl EventSender {
    pub fn new(generation: u64, tx: mpsc::Sender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue an event; returns false once the receiving side is gone
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }
}

/// One connection to the pub/sub broker
///
/// A handle is connected at most once; reconnecting means creating a new
/// handle through the [`TransportFactory`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Perform the broker handshake; resolves once it succeeded or failed
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<(), Self::Error>;

    /// Subscribe to `topic`
    async fn subscribe(&mut self, topic: &str, qos: DeliveryQos) -> Result<(), Self::Error>;

    /// Close the connection and release the handle's resources
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Check if the handle currently holds an established connection
    fn is_connected(&self) -> bool;
}

/// Creates transport handles wired to the manager's event queue
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport + 'static;

    fn create(&self, events: EventSender) -> Self::Transport;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sender_tags_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(7, tx);

        assert!(
            sender
                .emit(TransportEvent::ConnectionLost {
                    reason: "eof".to_string()
                })
                .await
        );

        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.generation, 7);
        assert!(matches!(tagged.event, TransportEvent::ConnectionLost { .. }));

        drop(rx);
        assert!(
            !sender
                .emit(TransportEvent::Message {
                    topic: "t".to_string(),
                    payload: vec![]
                })
                .await
        );
    }
}
