//! Pure routing decisions for rumqttc events
//!
//! The impure event loop in `client.rs` polls rumqttc and hands every event to
//! [`MessageHandler::route_mqtt_event`], which reduces it to the handful of
//! cases the transport cares about.

use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use tracing::debug;

/// Classifies rumqttc events without touching any connection state
pub struct MessageHandler;

impl MessageHandler {
    /// Only messages on the subscribed topic are forwarded
    pub fn should_process_message(topic: &str, expected_topic: &str) -> bool {
        let matches = topic == expected_topic;
        if !matches {
            debug!(expected = expected_topic, received = topic, "Ignoring message on unexpected topic");
        }
        matches
    }

    /// Reduce a polled event to the case the event loop acts on
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match &connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    refused => EventRoute::ConnectionRefused(format!("{refused:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => match suback
                    .return_codes
                    .iter()
                    .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                {
                    None => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    },
                    Some(refused) => EventRoute::SubscriptionRejected {
                        packet_id: suback.pkid,
                        reason: format!("{refused:?}"),
                    },
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decision for a single rumqttc event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    /// ConnAck with a non-success reason code
    ConnectionRefused(String),
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
    },
    /// Broker-initiated disconnect
    Disconnected(String),
    SubscriptionConfirmed {
        packet_id: u16,
    },
    /// SubAck carrying a failure code; no messages will follow
    SubscriptionRejected {
        packet_id: u16,
        reason: String,
    },
    InfrastructureEvent(String),
    OutgoingEvent,
}
