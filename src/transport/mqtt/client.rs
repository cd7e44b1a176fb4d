//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client and its event loop task. All decisions
//! about what an event means are delegated to the pure functions in
//! `message_handler.rs` and `connection.rs`.

use super::connection::{
    configure_mqtt_options, generate_client_id, to_mqtt_qos, MqttError, MqttTransportOptions,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{Credentials, Endpoint};
use crate::transport::{DeliveryQos, EventSender, Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period for the event loop to flush an outgoing DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// A single MQTT connection
///
/// The rumqttc event loop is never polled again after an error, so the client
/// does not reconnect on its own. Reconnection is the connection manager's job.
pub struct MqttTransport {
    options: MqttTransportOptions,
    events: EventSender,
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    topic_tx: watch::Sender<Option<String>>,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new(options: MqttTransportOptions, events: EventSender) -> Self {
        let (topic_tx, _) = watch::channel(None);
        Self {
            options,
            events,
            client: None,
            event_loop_handle: None,
            shutdown_tx: None,
            topic_tx,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Generation of the event queue this handle reports into
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    fn spawn_event_loop(
        &mut self,
        mut event_loop: EventLoop,
        connack_tx: oneshot::Sender<Result<(), String>>,
    ) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let topic_rx = self.topic_tx.subscribe();
        let connected = self.connected.clone();
        let events = self.events.clone();
        let generation = events.generation();
        let mut connack_tx = Some(connack_tx);

        let handle = tokio::spawn(async move {
            debug!(generation, "MQTT event loop started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(generation, "Shutdown signal received, stopping event loop");
                            break;
                        }
                    }
                    event_result = event_loop.poll() => {
                        let route = match event_result {
                            Ok(event) => MessageHandler::route_mqtt_event(&event),
                            Err(e) => EventRoute::Disconnected(e.to_string()),
                        };

                        match route {
                            EventRoute::ConnectionAcknowledged => {
                                connected.store(true, Ordering::SeqCst);
                                if let Some(tx) = connack_tx.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                            EventRoute::ConnectionRefused(code) => {
                                if let Some(tx) = connack_tx.take() {
                                    let _ = tx.send(Err(format!("broker refused connection: {code}")));
                                }
                                break;
                            }
                            EventRoute::MessageReceived { topic, payload } => {
                                let expected = topic_rx.borrow().clone();
                                let accepted = match expected {
                                    Some(expected) => {
                                        MessageHandler::should_process_message(&topic, &expected)
                                    }
                                    None => false,
                                };
                                if accepted && !events.emit(TransportEvent::Message { topic, payload }).await {
                                    break;
                                }
                            }
                            EventRoute::Disconnected(reason) => {
                                if connected.swap(false, Ordering::SeqCst) {
                                    warn!(generation, reason = %reason, "MQTT connection lost");
                                    events.emit(TransportEvent::ConnectionLost { reason }).await;
                                } else if let Some(tx) = connack_tx.take() {
                                    let _ = tx.send(Err(reason));
                                }
                                break;
                            }
                            EventRoute::SubscriptionConfirmed { packet_id } => {
                                debug!(generation, packet_id, "Subscription confirmed");
                            }
                            EventRoute::SubscriptionRejected { packet_id, reason } => {
                                // Without the subscription no reading can arrive
                                warn!(generation, packet_id, reason = %reason, "Broker rejected subscription");
                                if connected.swap(false, Ordering::SeqCst) {
                                    events
                                        .emit(TransportEvent::ConnectionLost {
                                            reason: format!("subscription rejected: {reason}"),
                                        })
                                        .await;
                                }
                                break;
                            }
                            EventRoute::InfrastructureEvent(event) => {
                                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                            }
                            EventRoute::OutgoingEvent => {}
                        }
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!(generation, "MQTT event loop stopped");
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop_handle = Some(handle);
    }

    fn stop_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Error = MqttError;

    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<(), MqttError> {
        if self.client.is_some() {
            return Err(MqttError::AlreadyStarted);
        }

        let client_id = generate_client_id(&self.options.client_id_prefix);
        let mqtt_options = configure_mqtt_options(&client_id, endpoint, credentials, &self.options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        self.client = Some(client);

        let (connack_tx, connack_rx) = oneshot::channel();
        self.spawn_event_loop(event_loop, connack_tx);

        match connack_rx.await {
            Ok(Ok(())) => {
                info!(
                    generation = self.generation(),
                    client_id = %client_id,
                    broker = %endpoint,
                    "Connected to MQTT broker"
                );
                Ok(())
            }
            Ok(Err(reason)) => {
                self.stop_event_loop();
                Err(MqttError::ConnectionFailed(reason))
            }
            Err(_) => {
                self.stop_event_loop();
                Err(MqttError::ConnectionFailed(
                    "event loop stopped before ConnAck".to_string(),
                ))
            }
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: DeliveryQos) -> Result<(), MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::NotConnected)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected);
        }

        self.topic_tx.send_replace(Some(topic.to_string()));
        client
            .subscribe(topic, to_mqtt_qos(qos))
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        info!(generation = self.generation(), topic = %topic, "Subscribed to topic");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        // Cleared first so the event loop treats the resulting close as intentional
        self.connected.store(false, Ordering::SeqCst);

        let result = match self.client.take() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| MqttError::DisconnectFailed(Box::new(e))),
            None => Ok(()),
        };

        if let Some(handle) = self.event_loop_handle.as_mut() {
            if tokio::time::timeout(DISCONNECT_GRACE, handle).await.is_err() {
                debug!(generation = self.generation(), "Event loop did not stop in time");
            }
        }
        self.stop_event_loop();

        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_event_loop();
    }
}

/// Builds one [`MqttTransport`] per connection attempt
#[derive(Debug, Clone, Default)]
pub struct MqttTransportFactory {
    options: MqttTransportOptions,
}

impl MqttTransportFactory {
    pub fn new(options: MqttTransportOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for MqttTransportFactory {
    type Transport = MqttTransport;

    fn create(&self, events: EventSender) -> MqttTransport {
        MqttTransport::new(self.options.clone(), events)
    }
}
